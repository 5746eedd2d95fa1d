//! Page-context script evaluation
//!
//! Runs a JS snippet against a loaded page and returns its string result,
//! racing "page finished" and a periodic poll against an absolute
//! deadline. Challenge-protected pages often fill in the wanted content
//! asynchronously well after the load event, so a single evaluate-on-load
//! is not enough.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::{EventLoadEventFired, SetDocumentContentParams};
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{EvalError, Result};
use crate::metrics::global_metrics;
use crate::surface::{SurfaceLease, SurfaceManager};

/// Default evaluation budget
pub const DEFAULT_EVAL_TIMEOUT_MS: u64 = 15_000;

/// Cadence of the late-content poll
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Evaluates page-context JavaScript on the shared surface.
pub struct ScriptEvaluator {
    manager: Arc<SurfaceManager>,
}

impl ScriptEvaluator {
    /// Create an evaluator over the shared surface
    pub fn new(manager: Arc<SurfaceManager>) -> Self {
        Self { manager }
    }

    /// Evaluate `script` and return its string result.
    ///
    /// With no `base_url` the script runs against the surface's current
    /// document immediately. Otherwise the surface navigates first; when
    /// `preserve_cookies` is set, a blank document is installed in place
    /// instead of a fresh navigation so the session's cookies survive.
    ///
    /// The first non-empty result from the load event or the 1 s poll
    /// wins; the deadline resolves the race to `Ok(None)`. Timeouts are a
    /// normal outcome, never an error. The surface is reset and released
    /// on every path.
    #[instrument(skip(self, script), fields(base_url = base_url.unwrap_or("<current>")))]
    pub async fn evaluate(
        &self,
        base_url: Option<&str>,
        script: &str,
        timeout_ms: u64,
        preserve_cookies: bool,
    ) -> Result<Option<String>> {
        let started = Instant::now();
        let lease = self.manager.acquire().await?;
        let result = evaluate_on(&lease, base_url, script, timeout_ms, preserve_cookies).await;
        lease.release().await;
        global_metrics().record_evaluation(started.elapsed());
        if result.is_err() {
            global_metrics().record_error("evaluate");
        }
        result
    }
}

async fn evaluate_on(
    lease: &SurfaceLease,
    base_url: Option<&str>,
    script: &str,
    timeout_ms: u64,
    preserve_cookies: bool,
) -> Result<Option<String>> {
    let page = lease.page();

    let Some(base_url) = base_url else {
        let result = page
            .evaluate(script)
            .await
            .map_err(|e| EvalError::ScriptFailed(e.to_string()))?;
        return Ok(content_from_value(result.value()));
    };

    let origin = Url::parse(base_url).map_err(|e| EvalError::InvalidBaseUrl(e.to_string()))?;
    let original_host = origin.host_str().map(str::to_string);

    // Pause main-frame navigations so redirects away from the original
    // host can be refused before the engine follows them.
    page.execute(EnableParams {
        handle_auth_requests: Some(false),
        patterns: Some(vec![RequestPattern {
            url_pattern: Some("*".into()),
            resource_type: Some(ResourceType::Document),
            request_stage: Some(RequestStage::Request),
        }]),
    })
    .await
    .map_err(|e| EvalError::NavigationFailed(e.to_string()))?;

    let mut navigations = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| EvalError::NavigationFailed(e.to_string()))?;
    let mut load_events = page
        .event_listener::<EventLoadEventFired>()
        .await
        .map_err(|e| EvalError::NavigationFailed(e.to_string()))?;

    // Page.navigate does not resolve while its own document request sits
    // paused in the Fetch domain; the navigation has to run off-loop.
    let mut nav_task = None;
    if preserve_cookies {
        install_blank_document(page).await?;
    } else {
        let nav_page = page.clone();
        let nav_url = base_url.to_string();
        nav_task = Some(tokio::spawn(async move {
            if let Err(e) = nav_page.goto(nav_url).await {
                debug!("navigation did not complete: {e}");
            }
        }));
    }

    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval_at(
        tokio::time::Instant::now() + POLL_INTERVAL,
        POLL_INTERVAL,
    );

    let outcome = loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("evaluation deadline elapsed");
                break None;
            }
            _ = poll.tick() => {
                if let Some(content) = try_evaluate(page, script).await {
                    debug!("content found via polling");
                    break Some(content);
                }
            }
            Some(_) = load_events.next() => {
                if let Some(content) = try_evaluate(page, script).await {
                    debug!("content found on page finished");
                    break Some(content);
                }
            }
            Some(paused) = navigations.next() => {
                gate_navigation(page, &paused, original_host.as_deref()).await;
            }
        }
    };

    if let Some(task) = nav_task {
        task.abort();
    }
    Ok(outcome)
}

/// Install a blank document against the current page without navigating,
/// so session cookies set by an earlier clearance are not dropped.
async fn install_blank_document(page: &Page) -> Result<()> {
    let frame_id = page
        .mainframe()
        .await
        .map_err(|e| EvalError::NavigationFailed(e.to_string()))?
        .ok_or_else(|| EvalError::NavigationFailed("no main frame".to_string()))?;
    page.execute(SetDocumentContentParams {
        frame_id,
        html: " ".to_string(),
    })
    .await
    .map_err(|e| EvalError::NavigationFailed(e.to_string()))?;
    Ok(())
}

/// Evaluate mid-navigation; transient CDP failures (context destroyed
/// between commits) count as "no result yet", not as operation faults.
async fn try_evaluate(page: &Page, script: &str) -> Option<String> {
    match page.evaluate(script).await {
        Ok(result) => content_from_value(result.value()),
        Err(e) => {
            debug!("evaluation attempt failed: {e}");
            None
        }
    }
}

/// Allow same-host navigations through, refuse the rest.
async fn gate_navigation(page: &Page, paused: &EventRequestPaused, original_host: Option<&str>) {
    let allowed = match (original_host, Url::parse(&paused.request.url)) {
        (Some(host), Ok(url)) => url
            .host_str()
            .map(|request_host| request_host.contains(host))
            .unwrap_or(false),
        // No host to compare against, or an unparseable target: let the
        // engine handle it.
        _ => true,
    };

    let outcome = if allowed {
        page.execute(ContinueRequestParams::new(paused.request_id.clone()))
            .await
            .map(|_| ())
    } else {
        debug!(url = %paused.request.url, "blocked redirect to external domain");
        page.execute(FailRequestParams::new(
            paused.request_id.clone(),
            ErrorReason::Aborted,
        ))
        .await
        .map(|_| ())
    };

    if let Err(e) = outcome {
        debug!("navigation gate command failed: {e}");
    }
}

/// Map an evaluation result to content: JS null/undefined and the literal
/// `"null"` sentinel both mean "nothing yet"; blank strings too.
fn content_from_value(value: Option<&Value>) -> Option<String> {
    let content = match value {
        None | Some(Value::Null) => return None,
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if content == "null" || content.trim().is_empty() {
        None
    } else {
        Some(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_absent() {
        assert_eq!(content_from_value(None), None);
        assert_eq!(content_from_value(Some(&Value::Null)), None);
    }

    #[test]
    fn test_content_null_sentinel() {
        let sentinel = json!("null");
        assert_eq!(content_from_value(Some(&sentinel)), None);
    }

    #[test]
    fn test_content_blank_is_nothing() {
        let blank = json!("   ");
        assert_eq!(content_from_value(Some(&blank)), None);
    }

    #[test]
    fn test_content_string_passthrough() {
        let value = json!("<html>payload</html>");
        assert_eq!(
            content_from_value(Some(&value)),
            Some("<html>payload</html>".to_string())
        );
    }

    #[test]
    fn test_content_non_string_serialized() {
        let value = json!({"token": "abc"});
        assert_eq!(
            content_from_value(Some(&value)),
            Some("{\"token\":\"abc\"}".to_string())
        );
    }
}
