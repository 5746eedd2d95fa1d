//! Error types for sekisho
//!
//! This module provides the error type hierarchy using `thiserror`
//! for proper error handling across all components.

use thiserror::Error;

/// The main error type for sekisho operations
#[derive(Error, Debug)]
pub enum Error {
    /// Browser surface errors
    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),

    /// Script evaluation errors
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// Challenge clearance errors
    #[error("Clearance error: {0}")]
    Clearance(#[from] ClearanceError),

    /// Request interception errors
    #[error("Interception error: {0}")]
    Intercept(#[from] InterceptError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// ChromiumOxide errors
    #[error("CDP error: {0}")]
    Cdp(String),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Browser surface lifecycle and checkout errors
#[derive(Error, Debug)]
pub enum SurfaceError {
    /// The browser engine is absent in this runtime. Callers should degrade
    /// to a non-automated path instead of retrying.
    #[error("Browser engine unavailable: {0}")]
    Unavailable(String),

    /// Surface configuration error
    #[error("Invalid surface configuration: {0}")]
    ConfigError(String),

    /// Failed to create the shared page
    #[error("Failed to create page: {0}")]
    PageCreationFailed(String),

    /// The cached surface died and could not be recreated
    #[error("Surface lost: {0}")]
    Lost(String),
}

/// Script evaluation errors
#[derive(Error, Debug)]
pub enum EvalError {
    /// The base URL could not be parsed
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// Navigation to the base URL failed
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    /// The script itself failed to execute
    #[error("Script execution failed: {0}")]
    ScriptFailed(String),
}

/// Challenge clearance errors
#[derive(Error, Debug)]
pub enum ClearanceError {
    /// The challenge page could not be loaded at all
    #[error("Challenge page load failed: {0}")]
    LoadFailed(String),

    /// Cookie inspection failed
    #[error("Cookie read failed: {0}")]
    CookieReadFailed(String),
}

/// Request interception errors
#[derive(Error, Debug)]
pub enum InterceptError {
    /// Invalid interception configuration
    #[error("Invalid interception config: {0}")]
    ConfigError(String),

    /// Navigation to the target page failed
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    /// A malformed request object was observed during capture
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Finalizing the capture session failed
    #[error("Finalization failed: {0}")]
    FinalizationFailed(String),
}

/// Result type alias for sekisho operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }

    /// Create a CDP error from a string
    pub fn cdp<S: Into<String>>(msg: S) -> Self {
        Error::Cdp(msg.into())
    }
}

/// Convert chromiumoxide errors
impl From<chromiumoxide::error::CdpError> for Error {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        Error::Cdp(err.to_string())
    }
}
