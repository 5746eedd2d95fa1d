//! Browser surface lifecycle management
//!
//! This module handles lazy launch, serialized checkout, and the
//! reset-on-release sequence for the single shared page.

use crate::error::{Result, SurfaceError};
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch;
use chromiumoxide::cdp::browser_protocol::page::{
    ResetNavigationHistoryParams, StopLoadingParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Configuration for the shared surface
#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    /// Run in headless mode (default: true)
    pub headless: bool,
    /// Viewport width (default: 1920)
    pub width: u32,
    /// Viewport height (default: 1080)
    pub height: u32,
    /// Enable sandbox (default: true for production)
    pub sandbox: bool,
    /// User agent override applied at page creation (None = engine default)
    pub user_agent: Option<String>,
    /// Path to Chrome/Chromium executable (None = auto-detect)
    pub chrome_path: Option<String>,
    /// Additional Chrome arguments
    pub extra_args: Vec<String>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            headless: true,
            width: 1920,
            height: 1080,
            sandbox: true,
            user_agent: None,
            chrome_path: None,
            extra_args: Vec::new(),
        }
    }
}

impl SurfaceConfig {
    /// Create a new config builder
    pub fn builder() -> SurfaceConfigBuilder {
        SurfaceConfigBuilder::default()
    }
}

/// Builder for SurfaceConfig
#[derive(Default)]
pub struct SurfaceConfigBuilder {
    config: SurfaceConfig,
}

impl SurfaceConfigBuilder {
    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    /// Set viewport dimensions
    pub fn viewport(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    /// Enable/disable sandbox
    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.config.sandbox = sandbox;
        self
    }

    /// Set user agent
    pub fn user_agent<S: Into<String>>(mut self, ua: S) -> Self {
        self.config.user_agent = Some(ua.into());
        self
    }

    /// Set Chrome path
    pub fn chrome_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.chrome_path = Some(path.into());
        self
    }

    /// Add extra Chrome argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.config.extra_args.push(arg.into());
        self
    }

    /// Build the config
    pub fn build(self) -> SurfaceConfig {
        self.config
    }
}

/// Single-slot cache behind the checkout lock
struct SurfaceSlot {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    default_user_agent: Option<String>,
}

/// Owns the single reusable browser surface.
///
/// The surface is created on first checkout and cached across calls. A
/// cached page is revalidated on every checkout; a dead page (or dead
/// browser) is replaced transparently, so callers must not assume identity
/// stability. One async mutex serializes acquire-through-release for every
/// driving component; waiters suspend and are served in FIFO order.
pub struct SurfaceManager {
    config: SurfaceConfig,
    slot: Arc<Mutex<SurfaceSlot>>,
}

impl SurfaceManager {
    /// Create a manager with default config. Nothing is launched until the
    /// first [`acquire`](Self::acquire).
    pub fn new() -> Self {
        Self::with_config(SurfaceConfig::default())
    }

    /// Create a manager with custom config
    pub fn with_config(config: SurfaceConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(SurfaceSlot {
                browser: None,
                handler_task: None,
                page: None,
                default_user_agent: None,
            })),
        }
    }

    /// Check out the shared surface for exclusive use.
    ///
    /// Blocks (suspending) until every earlier operation has released.
    /// The returned lease must be [`release`](SurfaceLease::release)d on
    /// every path, including after failures.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<SurfaceLease> {
        let mut slot = self.slot.clone().lock_owned().await;

        if let Some(page) = slot.page.clone() {
            // Liveness probe; a reclaimed page is replaced, not resurrected.
            match page.url().await {
                Ok(_) => {
                    debug!("reusing cached surface");
                    let default_user_agent = slot.default_user_agent.clone();
                    return Ok(SurfaceLease {
                        guard: slot,
                        page,
                        default_user_agent,
                    });
                }
                Err(e) => {
                    debug!("cached surface is gone ({e}), recreating");
                    slot.page = None;
                }
            }
        }

        let page = match self.create_page(&mut slot).await {
            Ok(page) => page,
            Err(e) => {
                // The whole browser may have died with the page.
                warn!("page creation failed ({e}), relaunching browser");
                shutdown_slot(&mut slot).await;
                self.create_page(&mut slot).await?
            }
        };

        if let Some(ua) = &self.config.user_agent {
            page.set_user_agent(ua.as_str())
                .await
                .map_err(|e| SurfaceError::PageCreationFailed(e.to_string()))?;
        }

        slot.page = Some(page.clone());
        let default_user_agent = slot.default_user_agent.clone();
        Ok(SurfaceLease {
            guard: slot,
            page,
            default_user_agent,
        })
    }

    async fn create_page(&self, slot: &mut SurfaceSlot) -> Result<Page> {
        if slot.browser.is_none() {
            let (browser, task) = launch_browser(&self.config).await?;
            slot.browser = Some(browser);
            slot.handler_task = Some(task);
        }
        let page = {
            let browser = slot.browser.as_ref().ok_or_else(|| {
                SurfaceError::Unavailable("browser launch produced nothing".to_string())
            })?;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| SurfaceError::PageCreationFailed(e.to_string()))?
        };

        if slot.default_user_agent.is_none() {
            slot.default_user_agent = default_user_agent_of(&page).await;
        }

        debug!("created new surface page");
        Ok(page)
    }

    /// Shut the browser down. Only needed by hosts that want a clean exit;
    /// the surface is otherwise kept for the process lifetime.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        shutdown_slot(&mut slot).await;
        info!("surface manager closed");
    }
}

impl Default for SurfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn launch_browser(config: &SurfaceConfig) -> Result<(Browser, JoinHandle<()>)> {
    info!(headless = config.headless, "launching browser engine");

    let mut builder = CdpBrowserConfig::builder();

    builder = builder.viewport(chromiumoxide::handler::viewport::Viewport {
        width: config.width,
        height: config.height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: true,
        has_touch: false,
    });

    if !config.headless {
        builder = builder.with_head();
    }

    if !config.sandbox {
        builder = builder.arg("--no-sandbox");
    }

    if let Some(ref path) = config.chrome_path {
        builder = builder.chrome_executable(path);
    }

    for arg in &config.extra_args {
        builder = builder.arg(arg);
    }

    let cdp_config = builder
        .build()
        .map_err(|e| SurfaceError::ConfigError(e.to_string()))?;

    // A missing engine is a degradable condition, not a crash: callers see
    // Unavailable and can fall back to a non-automated path.
    let (browser, mut handler) = Browser::launch(cdp_config)
        .await
        .map_err(|e| SurfaceError::Unavailable(e.to_string()))?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                warn!("browser handler event error");
                break;
            }
        }
        debug!("browser handler finished");
    });

    info!("browser engine launched");
    Ok((browser, handler_task))
}

/// The engine default user agent, needed to undo per-session overrides on
/// release.
async fn default_user_agent_of(page: &Page) -> Option<String> {
    match page.evaluate("navigator.userAgent").await {
        Ok(result) => result
            .value()
            .and_then(|v| v.as_str())
            .map(str::to_string),
        Err(e) => {
            warn!("could not read default user agent: {e}");
            None
        }
    }
}

async fn shutdown_slot(slot: &mut SurfaceSlot) {
    slot.page = None;
    if let Some(mut browser) = slot.browser.take() {
        if let Err(e) = browser.close().await {
            debug!("browser close failed: {e}");
        }
    }
    if let Some(task) = slot.handler_task.take() {
        task.abort();
    }
}

/// Exclusive checkout of the shared surface.
///
/// Holds the manager lock; dropping the lease releases waiters but skips
/// the reset sequence, so operations should call
/// [`release`](Self::release) on their way out instead.
pub struct SurfaceLease {
    guard: OwnedMutexGuard<SurfaceSlot>,
    page: Page,
    default_user_agent: Option<String>,
}

impl SurfaceLease {
    /// The checked-out page
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The engine's default user agent, captured at launch
    pub fn default_user_agent(&self) -> Option<&str> {
        self.default_user_agent.as_deref()
    }

    /// Reset the surface to a neutral state and check it back in: stop any
    /// in-flight load, drop request interception, restore the default user
    /// agent, blank the page, clear history.
    #[instrument(skip(self))]
    pub async fn release(mut self) {
        let page = self.page.clone();
        let reset = async {
            page.execute(StopLoadingParams::default()).await?;
            page.execute(fetch::DisableParams::default()).await?;
            if let Some(ua) = &self.default_user_agent {
                page.set_user_agent(ua.as_str()).await?;
            }
            page.goto("about:blank").await?;
            page.execute(ResetNavigationHistoryParams::default()).await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };

        if let Err(e) = reset.await {
            // A surface that cannot be reset cannot be trusted for the
            // next session; evict it so acquire() recreates.
            warn!("surface reset failed ({e}), evicting cached page");
            self.guard.page = None;
        }
        debug!("surface released");
    }

    /// Evict the cached page without resetting, for operations that
    /// observed the surface die underneath them.
    pub fn discard(mut self) {
        self.guard.page = None;
        debug!("surface discarded");
    }
}
