//! Outgoing-request interception
//!
//! Captures every request the browser context makes while loading a URL —
//! same-page AJAX included — filters them against caller-supplied
//! predicates and limits, and reports a terminal result exactly once.
//! This is how tokens that a page computes client-side and never exposes
//! directly (e.g. the `vrf` parameter on reader AJAX calls) are recovered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::EventLoadEventFired;
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{InterceptError, Result};
use crate::headers::cdp_headers_to_map;
use crate::metrics::global_metrics;
use crate::surface::{SurfaceLease, SurfaceManager};

/// Default capture budget
pub const DEFAULT_INTERCEPT_TIMEOUT_MS: u64 = 30_000;

/// Default hard cap on captured requests
pub const DEFAULT_MAX_REQUESTS: usize = 100;

/// Grace added to the caller budget for in-flight finalization
const COMPLETION_GRACE_MS: u64 = 5_000;

/// Window after the load event for trailing asynchronous calls
const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// A request the browser context made during capture. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptedRequest {
    /// The full URL of the request
    pub url: String,
    /// HTTP method (GET, POST, ...)
    pub method: String,
    /// Request headers as key/value pairs
    pub headers: HashMap<String, String>,
    /// Capture time, epoch milliseconds
    pub timestamp: i64,
    /// Request body, when one was attached
    pub body: Option<String>,
}

impl InterceptedRequest {
    /// Extract a named, percent-decoded parameter from the URL's query
    /// string. Works on relative URLs too.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let after_path = self.url.splitn(2, '?').nth(1)?;
        let query = after_path.split('#').next().unwrap_or(after_path);
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Whether the URL contains a match for `pattern`
    pub fn url_matches(&self, pattern: &Regex) -> bool {
        pattern.is_match(&self.url)
    }

    /// Case-insensitive substring check on the URL
    pub fn url_contains(&self, fragment: &str) -> bool {
        self.url.to_lowercase().contains(&fragment.to_lowercase())
    }
}

/// Configuration for one capture session. Immutable once interception
/// starts.
#[derive(Debug, Clone, Default)]
pub struct InterceptionConfig {
    /// Overall capture budget in milliseconds (default 30 000)
    pub timeout_ms: Option<u64>,
    /// Hard cap on captured requests (default 100)
    pub max_requests: Option<usize>,
    /// Optional pre-filter applied before the accept predicate
    pub url_pattern: Option<Regex>,
    /// Script injected once when the page finishes loading, for pages
    /// whose interesting AJAX only fires after a client-side nudge
    pub page_script: Option<String>,
}

impl InterceptionConfig {
    fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_INTERCEPT_TIMEOUT_MS)
    }

    fn max_requests(&self) -> usize {
        self.max_requests.unwrap_or(DEFAULT_MAX_REQUESTS)
    }
}

/// Why a capture session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    /// The capture budget elapsed (a normal outcome)
    Timeout,
    /// The hard cap was reached
    MaxReached,
    /// The caller's stop handle fired
    ManualStop,
    /// The event channel died underneath the session
    Error,
}

/// The outcome of one capture session: requests in observation order plus
/// exactly one completion reason. Per-request faults that did not end the
/// session ride along on the error channel.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Captured requests, observation order preserved
    pub requests: Vec<InterceptedRequest>,
    /// The single terminal reason
    pub reason: CompletionReason,
    /// Non-fatal faults observed during capture
    pub faults: Vec<String>,
}

/// Verdict of offering one request to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Rejected,
    Accepted,
    AcceptedAndFull,
}

/// Mutable state of one capture session, shared between the event loop
/// and the competing completion triggers. The `capturing` flag makes the
/// terminal transition idempotent: whichever trigger wins, completion is
/// observed exactly once.
struct CaptureSession {
    max_requests: usize,
    url_pattern: Option<Regex>,
    captured: Mutex<Vec<InterceptedRequest>>,
    faults: Mutex<Vec<String>>,
    capturing: AtomicBool,
}

impl CaptureSession {
    fn new(config: &InterceptionConfig) -> Self {
        Self {
            max_requests: config.max_requests(),
            url_pattern: config.url_pattern.clone(),
            captured: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            capturing: AtomicBool::new(true),
        }
    }

    /// Offer a request: cap, then pattern, then predicate, in that order.
    /// Appends happen under the capture lock so the terminal callback
    /// always observes every request accepted before its trigger.
    fn observe<F>(&self, request: InterceptedRequest, accept: &F) -> Observation
    where
        F: Fn(&InterceptedRequest) -> bool,
    {
        if !self.capturing.load(Ordering::Acquire) {
            return Observation::Rejected;
        }
        if self.captured.lock().len() >= self.max_requests {
            return Observation::Rejected;
        }
        if let Some(pattern) = &self.url_pattern {
            if !request.url_matches(pattern) {
                return Observation::Rejected;
            }
        }
        if !accept(&request) {
            return Observation::Rejected;
        }

        let mut captured = self.captured.lock();
        if captured.len() >= self.max_requests {
            return Observation::Rejected;
        }
        captured.push(request);
        if captured.len() >= self.max_requests {
            Observation::AcceptedAndFull
        } else {
            Observation::Accepted
        }
    }

    /// Report a non-fatal capture fault without ending the session.
    fn fault(&self, message: String) {
        warn!("capture fault: {message}");
        global_metrics().record_error("intercept");
        self.faults.lock().push(message);
    }

    /// Finalize with `reason`. Returns the result for exactly one caller;
    /// later triggers get `None`.
    fn finish(&self, reason: CompletionReason) -> Option<CaptureResult> {
        if self
            .capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(CaptureResult {
            requests: self.captured.lock().clone(),
            reason,
            faults: self.faults.lock().clone(),
        })
    }

    fn captured_count(&self) -> usize {
        self.captured.lock().len()
    }
}

/// Manual-stop signal for a running capture session. Cloneable; stopping
/// is sticky until the next session starts.
#[derive(Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    /// Ask the running session to finalize with `ManualStop`.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn rearm(&self) {
        self.requested.store(false, Ordering::Release);
    }

    async fn wait(&self) {
        while !self.requested.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
    }
}

/// Captures outgoing requests on the shared surface.
pub struct RequestInterceptor {
    manager: Arc<SurfaceManager>,
    stop: StopHandle,
}

impl RequestInterceptor {
    /// Create an interceptor over the shared surface
    pub fn new(manager: Arc<SurfaceManager>) -> Self {
        Self {
            manager,
            stop: StopHandle::default(),
        }
    }

    /// A handle that stops the currently running session. Stop requests
    /// issued while no session runs are cleared when the next one starts.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Load `url` and capture matching outgoing requests until a terminal
    /// trigger fires. Bounded by `config.timeout_ms` plus a small grace
    /// margin for in-flight work; timeouts are a normal completion, not an
    /// error.
    #[instrument(skip(self, config, accept), fields(url = %url))]
    pub async fn intercept<F>(
        &self,
        url: &str,
        config: &InterceptionConfig,
        accept: F,
    ) -> Result<CaptureResult>
    where
        F: Fn(&InterceptedRequest) -> bool + Send + Sync,
    {
        let session_id = Uuid::new_v4();
        let started = Instant::now();
        let session = CaptureSession::new(config);
        self.stop.rearm();
        debug!(%session_id, "interception session starting");

        let lease = self.manager.acquire().await?;
        let outer_budget = Duration::from_millis(config.timeout_ms() + COMPLETION_GRACE_MS);
        let run = run_session(&lease, url, config, &session, &accept, &self.stop);
        let result = match tokio::time::timeout(outer_budget, run).await {
            Ok(result) => result,
            // The inner deadline normally wins; the outer bound only
            // covers finalization work that wedged.
            Err(_) => Ok(session
                .finish(CompletionReason::Timeout)
                .ok_or_else(|| InterceptError::FinalizationFailed(
                    "session already finalized but never returned".to_string(),
                ))?),
        };
        lease.release().await;

        global_metrics().record_interception(session.captured_count(), started.elapsed());
        if let Ok(capture) = &result {
            info!(
                %session_id,
                captured = capture.requests.len(),
                reason = ?capture.reason,
                "interception session finished"
            );
        }
        result
    }

    /// Capture the URLs of requests matching `pattern` while `page_url`
    /// loads.
    pub async fn capture_urls(
        &self,
        page_url: &str,
        pattern: Regex,
        timeout_ms: u64,
    ) -> Result<Vec<String>> {
        let config = InterceptionConfig {
            timeout_ms: Some(timeout_ms),
            max_requests: Some(50),
            url_pattern: Some(pattern.clone()),
            page_script: None,
        };

        let capture = self
            .intercept(page_url, &config, |request| request.url_matches(&pattern))
            .await?;
        Ok(capture.requests.into_iter().map(|r| r.url).collect())
    }

    /// Extract the `vrf` token some readers attach to their AJAX calls.
    /// Returns the first match's decoded value, or `None` when the page
    /// never issued a matching request within the budget.
    pub async fn extract_vrf_token(
        &self,
        page_url: &str,
        timeout_ms: u64,
    ) -> Result<Option<String>> {
        let pattern = Regex::new(r"/ajax/read/.*[?&]vrf=([^&]+)")
            .map_err(|e| InterceptError::ConfigError(e.to_string()))?;
        let config = InterceptionConfig {
            timeout_ms: Some(timeout_ms),
            max_requests: Some(10),
            url_pattern: Some(pattern),
            page_script: None,
        };

        let capture = self
            .intercept(page_url, &config, |request| {
                request.url_contains("/ajax/read/") && request.url_contains("vrf=")
            })
            .await?;

        Ok(capture
            .requests
            .first()
            .and_then(|request| request.query_param("vrf")))
    }
}

async fn run_session<F>(
    lease: &SurfaceLease,
    url: &str,
    config: &InterceptionConfig,
    session: &CaptureSession,
    accept: &F,
    stop: &StopHandle,
) -> Result<CaptureResult>
where
    F: Fn(&InterceptedRequest) -> bool + Send + Sync,
{
    let page = lease.page();

    page.execute(EnableParams {
        handle_auth_requests: Some(false),
        patterns: Some(vec![RequestPattern {
            url_pattern: Some("*".into()),
            resource_type: None,
            request_stage: Some(RequestStage::Request),
        }]),
    })
    .await
    .map_err(|e| InterceptError::NavigationFailed(e.to_string()))?;

    let mut observed = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| InterceptError::NavigationFailed(e.to_string()))?;
    let mut load_events = page
        .event_listener::<EventLoadEventFired>()
        .await
        .map_err(|e| InterceptError::NavigationFailed(e.to_string()))?;

    // The navigate command cannot resolve while its own document request
    // is paused; drive it off-loop.
    let nav_page = page.clone();
    let nav_url = url.to_string();
    let nav_task = tokio::spawn(async move {
        if let Err(e) = nav_page.goto(nav_url).await {
            debug!("capture navigation did not complete: {e}");
        }
    });

    let deadline = tokio::time::sleep(Duration::from_millis(config.timeout_ms()));
    tokio::pin!(deadline);
    // Armed at the first load event; far future until then.
    let settle = tokio::time::sleep(Duration::from_secs(86_400));
    tokio::pin!(settle);
    let mut settle_armed = false;
    let mut script_injected = false;

    let reason = loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("capture budget elapsed");
                break CompletionReason::Timeout;
            }
            _ = &mut settle, if settle_armed => {
                debug!("post-load settle window elapsed");
                break CompletionReason::Timeout;
            }
            _ = stop.wait() => {
                debug!("manual stop requested");
                break CompletionReason::ManualStop;
            }
            event = observed.next() => {
                let Some(paused) = event else {
                    session.fault("request event channel closed".to_string());
                    break CompletionReason::Error;
                };
                if handle_paused(page, session, accept, &paused, url).await {
                    break CompletionReason::MaxReached;
                }
            }
            Some(_) = load_events.next() => {
                if !settle_armed {
                    settle.as_mut().reset(tokio::time::Instant::now() + SETTLE_DELAY);
                    settle_armed = true;
                }
                if let Some(script) = &config.page_script {
                    if !script_injected {
                        script_injected = true;
                        debug!("injecting page script");
                        if let Err(e) = page.evaluate(script.as_str()).await {
                            session.fault(format!("page script failed: {e}"));
                        }
                    }
                }
            }
        }
    };

    nav_task.abort();

    session.finish(reason).ok_or_else(|| {
        InterceptError::FinalizationFailed("completion already consumed".to_string()).into()
    })
}

/// Offer one paused request to the session, then let it proceed. Accepted
/// navigations are cancelled so a matched redirect counts as captured
/// rather than followed; the initial load of `target_url` itself is
/// exempt or nothing would ever render. Returns true when the cap was
/// just reached.
async fn handle_paused<F>(
    page: &Page,
    session: &CaptureSession,
    accept: &F,
    paused: &EventRequestPaused,
    target_url: &str,
) -> bool
where
    F: Fn(&InterceptedRequest) -> bool + Send + Sync,
{
    let request = InterceptedRequest {
        url: paused.request.url.clone(),
        method: paused.request.method.clone(),
        headers: cdp_headers_to_map(&paused.request.headers),
        timestamp: chrono::Utc::now().timestamp_millis(),
        body: paused.request.post_data_entries.as_ref().map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.bytes.as_ref())
                .map(|b| AsRef::<str>::as_ref(b))
                .collect::<String>()
        }),
    };

    let observation = session.observe(request, accept);
    let cancellable_navigation = paused.resource_type == ResourceType::Document
        && paused.request.url.trim_end_matches('/') != target_url.trim_end_matches('/');

    let command = if observation != Observation::Rejected && cancellable_navigation {
        debug!(url = %paused.request.url, "captured navigation cancelled");
        page.execute(FailRequestParams::new(
            paused.request_id.clone(),
            ErrorReason::Aborted,
        ))
        .await
        .map(|_| ())
    } else {
        page.execute(ContinueRequestParams::new(paused.request_id.clone()))
            .await
            .map(|_| ())
    };

    if let Err(e) = command {
        session.fault(format!("request release failed for {}: {e}", paused.request.url));
    }

    observation == Observation::AcceptedAndFull
}
