//! sekisho — embedded-browser clearance & interception engine
//!
//! This crate drives a single shared browser surface (Chrome/Chromium over
//! CDP) to get past JavaScript anti-bot gates and to recover data that
//! only exists inside a live page:
//!
//! - **Clearance**: load a challenge page and detect success by watching
//!   the clearance cookie change, with loop detection for challenges that
//!   never resolve.
//! - **Evaluation**: run page-context JavaScript and return its string
//!   result, racing load-finished and poll signals against a deadline.
//! - **Interception**: capture the requests a page makes while loading
//!   (AJAX included) to extract tokens computed client-side.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ Engine ──▶ SurfaceManager (one page, FIFO lock)
//!                │              │
//!     ┌──────────┼──────────┐   ▼
//!     ▼          ▼          ▼  shared CDP surface
//! ScriptEval  ClearanceGate RequestInterceptor
//!                │
//!                ▼
//!          ReplayClient (out-of-band, filtered headers)
//! ```
//!
//! Exactly one of the three driving operations owns the surface at any
//! instant; the manager resets it between uses. The engine is a library
//! with no CLI or server surface — request-fetching logic falls back to
//! it when a plain HTTP fetch gets a challenge response.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sekisho::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new()?;
//!
//!     // Pull a token the page computes client-side
//!     let token = engine
//!         .interceptor()
//!         .extract_vrf_token("https://example.com/read/1", 15_000)
//!         .await?;
//!
//!     println!("vrf: {token:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clearance;
pub mod error;
pub mod evaluate;
pub mod headers;
pub mod intercept;
pub mod metrics;
pub mod surface;

use std::sync::Arc;

// Re-exports for convenience
pub use clearance::{ClearanceConfig, ClearanceGate, ClearanceOutcome, ClearanceTracker};
pub use error::{Error, Result};
pub use evaluate::ScriptEvaluator;
pub use headers::{HeaderPolicy, ReplayClient};
pub use intercept::{
    CaptureResult, CompletionReason, InterceptedRequest, InterceptionConfig, RequestInterceptor,
    StopHandle,
};
pub use surface::{SurfaceConfig, SurfaceManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Facade wiring the three driving components over one shared surface.
///
/// Components can also be constructed individually around an
/// `Arc<SurfaceManager>` when a host only needs one of them.
pub struct Engine {
    manager: Arc<SurfaceManager>,
    evaluator: ScriptEvaluator,
    clearance: ClearanceGate,
    interceptor: RequestInterceptor,
}

impl Engine {
    /// Create an engine with default surface config. The browser is not
    /// launched until the first operation runs.
    pub fn new() -> Result<Self> {
        Self::with_config(SurfaceConfig::default())
    }

    /// Create an engine with custom surface config
    pub fn with_config(config: SurfaceConfig) -> Result<Self> {
        let manager = Arc::new(SurfaceManager::with_config(config));
        Ok(Self {
            evaluator: ScriptEvaluator::new(Arc::clone(&manager)),
            clearance: ClearanceGate::new(Arc::clone(&manager))?,
            interceptor: RequestInterceptor::new(Arc::clone(&manager)),
            manager,
        })
    }

    /// The script evaluator
    pub fn evaluator(&self) -> &ScriptEvaluator {
        &self.evaluator
    }

    /// The challenge clearance gate
    pub fn clearance(&self) -> &ClearanceGate {
        &self.clearance
    }

    /// The request interceptor
    pub fn interceptor(&self) -> &RequestInterceptor {
        &self.interceptor
    }

    /// The shared surface manager
    pub fn surface_manager(&self) -> &Arc<SurfaceManager> {
        &self.manager
    }

    /// Shut the shared surface down for a clean host exit
    pub async fn close(&self) {
        self.manager.close().await;
    }
}
