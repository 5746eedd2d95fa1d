//! Challenge clearance detection
//!
//! An anti-bot challenge page gives no explicit completion event; the only
//! reliable success signal is the designated clearance cookie changing
//! value. The gate loads the challenge page, re-reads the cookie on every
//! navigation start, and reports success, a hopeless loop, or a timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FulfillRequestParams, HeaderEntry,
    RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::Cookie;
use chromiumoxide::cdp::browser_protocol::page::{EventFrameStartedLoading, EventLoadEventFired};
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{ClearanceError, Result};
use crate::headers::{HeaderPolicy, ReplayClient};
use crate::metrics::global_metrics;
use crate::surface::{SurfaceLease, SurfaceManager};

/// Cookie whose change signals a solved challenge
pub const CLEARANCE_COOKIE: &str = "cf_clearance";

/// Unchanged-cookie checks tolerated before declaring a loop
const LOOP_THRESHOLD: u32 = 3;

/// Default clearance budget
pub const DEFAULT_CLEARANCE_TIMEOUT_MS: u64 = 30_000;

/// Terminal outcome of a clearance attempt. All three are ordinary
/// outcomes; only setup failures become errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearanceOutcome {
    /// The clearance cookie changed; the origin will now serve content
    Cleared,
    /// The challenge reloaded several times without progress; callers
    /// should abort rather than spin
    LoopDetected,
    /// The budget elapsed before either signal
    TimedOut,
}

/// Per-check verdict of the tracker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearanceCheck {
    /// Cookie changed and is non-null
    Cleared,
    /// No change yet, keep watching
    Pending,
    /// Threshold of unchanged checks reached; counter was reset
    LoopDetected,
}

/// The clearance state machine: a baseline cookie value and a loop
/// counter. Pure so the loop semantics are testable without a browser.
#[derive(Debug)]
pub struct ClearanceTracker {
    baseline: Option<String>,
    counter: u32,
}

impl ClearanceTracker {
    /// Start tracking from the cookie value seen at session start
    pub fn new(baseline: Option<String>) -> Self {
        Self {
            baseline,
            counter: 0,
        }
    }

    /// Feed the current cookie value at a navigation-start event.
    ///
    /// A changed, non-null value clears. Otherwise the loop counter
    /// advances; on the third consecutive unchanged check the tracker
    /// reports a loop exactly once and zeroes the counter, so the next
    /// report again requires three further unchanged checks.
    pub fn observe(&mut self, current: Option<&str>) -> ClearanceCheck {
        match current {
            Some(value) if self.baseline.as_deref() != Some(value) => ClearanceCheck::Cleared,
            _ => {
                self.counter += 1;
                if self.counter >= LOOP_THRESHOLD {
                    self.counter = 0;
                    ClearanceCheck::LoopDetected
                } else {
                    ClearanceCheck::Pending
                }
            }
        }
    }

    /// Zero the loop counter; the baseline is kept so a fresh attempt
    /// still detects the original cookie as "unchanged".
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// The baseline value recorded at session start
    pub fn baseline(&self) -> Option<&str> {
        self.baseline.as_deref()
    }
}

/// Minimal cookie view used for clearance matching
#[derive(Debug, Clone)]
pub(crate) struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
}

impl From<&Cookie> for CookieRecord {
    fn from(cookie: &Cookie) -> Self {
        Self {
            name: cookie.name.clone(),
            value: cookie.value.clone(),
            domain: cookie.domain.clone(),
        }
    }
}

/// Find the clearance cookie scoped to `host`, RFC 6265 domain-matching:
/// an exact host match or a parent-domain cookie (`.example.com`).
pub(crate) fn clearance_cookie_value(cookies: &[CookieRecord], host: &str) -> Option<String> {
    cookies.iter().find_map(|cookie| {
        if cookie.name != CLEARANCE_COOKIE {
            return None;
        }
        let domain = cookie.domain.trim_start_matches('.');
        if host == domain || host.ends_with(&format!(".{domain}")) {
            Some(cookie.value.clone())
        } else {
            None
        }
    })
}

/// Configuration for a clearance attempt
#[derive(Debug, Clone, Default)]
pub struct ClearanceConfig {
    /// Overall budget in milliseconds (default 30 000)
    pub timeout_ms: Option<u64>,
    /// Per-session user agent override; the source being cleared may pin
    /// one, and a mismatch with later plain fetches re-triggers challenges
    pub user_agent: Option<String>,
    /// When set, every non-POST request the challenge page makes is
    /// rewritten by this policy and replayed out-of-band, hiding the
    /// embedded engine's fingerprint from the origin
    pub header_mode: Option<HeaderPolicy>,
}

/// Drives the shared surface through a challenge until the clearance
/// cookie changes, a loop is detected, or the budget runs out.
pub struct ClearanceGate {
    manager: Arc<SurfaceManager>,
    replay: ReplayClient,
    tracker: Mutex<Option<ClearanceTracker>>,
}

impl ClearanceGate {
    /// Create a gate over the shared surface
    pub fn new(manager: Arc<SurfaceManager>) -> Result<Self> {
        Ok(Self {
            manager,
            replay: ReplayClient::new()?,
            tracker: Mutex::new(None),
        })
    }

    /// Zero the loop counter, keeping the baseline, so this gate instance
    /// can be reused for a fresh attempt against the same target.
    pub fn reset(&self) {
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.reset();
        }
    }

    /// Attempt to clear the challenge protecting `target_url`.
    #[instrument(skip(self, config), fields(url = %target_url))]
    pub async fn resolve(
        &self,
        target_url: &str,
        config: &ClearanceConfig,
    ) -> Result<ClearanceOutcome> {
        let started = Instant::now();
        let lease = self.manager.acquire().await?;
        let result = self.solve_on(&lease, target_url, config).await;
        lease.release().await;
        global_metrics().record_clearance_attempt(started.elapsed());
        if result.is_err() {
            global_metrics().record_error("clearance");
        }
        result
    }

    async fn solve_on(
        &self,
        lease: &SurfaceLease,
        target_url: &str,
        config: &ClearanceConfig,
    ) -> Result<ClearanceOutcome> {
        let page = lease.page();
        let host = Url::parse(target_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| ClearanceError::LoadFailed(format!("no host in {target_url}")))?;

        if let Some(ua) = &config.user_agent {
            page.set_user_agent(ua.as_str())
                .await
                .map_err(|e| ClearanceError::LoadFailed(e.to_string()))?;
        }

        let baseline = read_clearance(page, &host).await?;
        {
            let mut tracker = self.tracker.lock();
            if tracker.is_none() {
                *tracker = Some(ClearanceTracker::new(baseline.clone()));
            }
        }
        debug!(?baseline, "challenge session started");

        let mut paused_requests = if config.header_mode.is_some() {
            page.execute(EnableParams {
                handle_auth_requests: Some(false),
                patterns: Some(vec![RequestPattern {
                    url_pattern: Some("*".into()),
                    resource_type: None,
                    request_stage: Some(RequestStage::Request),
                }]),
            })
            .await
            .map_err(|e| ClearanceError::LoadFailed(e.to_string()))?;
            Some(
                page.event_listener::<EventRequestPaused>()
                    .await
                    .map_err(|e| ClearanceError::LoadFailed(e.to_string()))?,
            )
        } else {
            None
        };

        let mut nav_starts = page
            .event_listener::<EventFrameStartedLoading>()
            .await
            .map_err(|e| ClearanceError::LoadFailed(e.to_string()))?;
        let mut load_events = page
            .event_listener::<EventLoadEventFired>()
            .await
            .map_err(|e| ClearanceError::LoadFailed(e.to_string()))?;
        let main_frame = page.mainframe().await.ok().flatten();

        // Challenge pages reload themselves; with the Fetch domain active
        // the navigate command would not resolve until its own paused
        // request is continued, so it runs off-loop.
        let nav_page = page.clone();
        let nav_url = target_url.to_string();
        let nav_task = tokio::spawn(async move {
            if let Err(e) = nav_page.goto(nav_url).await {
                debug!("challenge navigation did not complete: {e}");
            }
        });

        let timeout_ms = config.timeout_ms.unwrap_or(DEFAULT_CLEARANCE_TIMEOUT_MS);
        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("clearance attempt timed out");
                    break Ok(ClearanceOutcome::TimedOut);
                }
                Some(started) = nav_starts.next() => {
                    if let Some(main) = &main_frame {
                        if &started.frame_id != main {
                            continue;
                        }
                    }
                    let current = match read_clearance(page, &host).await {
                        Ok(current) => current,
                        Err(e) => break Err(e),
                    };
                    let check = {
                        let mut tracker = self.tracker.lock();
                        match tracker.as_mut() {
                            Some(t) => t.observe(current.as_deref()),
                            None => ClearanceCheck::Pending,
                        }
                    };
                    match check {
                        ClearanceCheck::Cleared => {
                            info!("clearance cookie changed, challenge passed");
                            break Ok(ClearanceOutcome::Cleared);
                        }
                        ClearanceCheck::LoopDetected => {
                            warn!("challenge loop detected");
                            break Ok(ClearanceOutcome::LoopDetected);
                        }
                        ClearanceCheck::Pending => {}
                    }
                }
                Some(_) = load_events.next() => {
                    debug!("challenge page finished loading");
                }
                Some(paused) = next_paused(&mut paused_requests) => {
                    if let Some(mode) = config.header_mode {
                        spawn_replay(page.clone(), self.replay.clone(), mode, paused);
                    }
                }
            }
        };

        nav_task.abort();
        outcome
    }
}

async fn next_paused(
    stream: &mut Option<impl futures::Stream<Item = Arc<EventRequestPaused>> + Unpin>,
) -> Option<Arc<EventRequestPaused>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn read_clearance(page: &Page, host: &str) -> Result<Option<String>> {
    let cookies = page
        .get_cookies()
        .await
        .map_err(|e| ClearanceError::CookieReadFailed(e.to_string()))?;
    let records: Vec<CookieRecord> = cookies.iter().map(CookieRecord::from).collect();
    Ok(clearance_cookie_value(&records, host))
}

/// Replay a paused request off the surface lock and fulfill the paused
/// fetch with the result; on any failure the request continues through the
/// engine's own stack.
fn spawn_replay(
    page: Page,
    replay: ReplayClient,
    mode: HeaderPolicy,
    paused: Arc<EventRequestPaused>,
) {
    tokio::spawn(async move {
        let request_id = paused.request_id.clone();
        let method = paused.request.method.clone();
        let url = paused.request.url.clone();

        let replaced = if method.eq_ignore_ascii_case("POST") {
            None
        } else {
            let raw = crate::headers::cdp_headers_to_map(&paused.request.headers);
            let filtered = mode.filter(&raw);
            replay.replay(&method, &url, &filtered).await
        };

        let outcome = match replaced {
            Some(response) => {
                let headers: Vec<HeaderEntry> = response
                    .headers
                    .iter()
                    .map(|(name, value)| HeaderEntry {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect();
                let mut params =
                    FulfillRequestParams::new(request_id.clone(), response.status as i64);
                params.response_headers = Some(headers);
                params.body = Some(BASE64.encode(&response.body).into());
                page.execute(params).await.map(|_| ())
            }
            None => page
                .execute(ContinueRequestParams::new(request_id.clone()))
                .await
                .map(|_| ()),
        };

        if let Err(e) = outcome {
            // The session may already be finalized; a late command against
            // a reset surface is harmless.
            debug!(url = %url, "replay completion command failed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_clears_on_changed_cookie() {
        let mut tracker = ClearanceTracker::new(Some("old".into()));
        assert_eq!(tracker.observe(Some("new")), ClearanceCheck::Cleared);
    }

    #[test]
    fn test_tracker_null_is_not_cleared() {
        let mut tracker = ClearanceTracker::new(Some("old".into()));
        assert_eq!(tracker.observe(None), ClearanceCheck::Pending);
    }

    #[test]
    fn test_tracker_clears_from_null_baseline() {
        let mut tracker = ClearanceTracker::new(None);
        assert_eq!(tracker.observe(Some("fresh")), ClearanceCheck::Cleared);
    }

    #[test]
    fn test_tracker_loop_after_three_unchanged() {
        let mut tracker = ClearanceTracker::new(Some("same".into()));
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::Pending);
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::Pending);
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::LoopDetected);
        // Counter was zeroed: the next unchanged check does not re-trigger
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::Pending);
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::Pending);
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::LoopDetected);
    }

    #[test]
    fn test_tracker_reset_keeps_baseline() {
        let mut tracker = ClearanceTracker::new(Some("same".into()));
        tracker.observe(Some("same"));
        tracker.observe(Some("same"));
        tracker.reset();
        assert_eq!(tracker.baseline(), Some("same"));
        // Reset counter: three more unchanged checks needed
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::Pending);
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::Pending);
        assert_eq!(tracker.observe(Some("same")), ClearanceCheck::LoopDetected);
    }

    fn cookie(name: &str, value: &str, domain: &str) -> CookieRecord {
        CookieRecord {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        }
    }

    #[test]
    fn test_clearance_cookie_exact_domain() {
        let cookies = vec![cookie(CLEARANCE_COOKIE, "tok", "example.com")];
        assert_eq!(
            clearance_cookie_value(&cookies, "example.com"),
            Some("tok".into())
        );
    }

    #[test]
    fn test_clearance_cookie_parent_domain() {
        let cookies = vec![cookie(CLEARANCE_COOKIE, "tok", ".example.com")];
        assert_eq!(
            clearance_cookie_value(&cookies, "read.example.com"),
            Some("tok".into())
        );
    }

    #[test]
    fn test_clearance_cookie_foreign_domain_ignored() {
        let cookies = vec![cookie(CLEARANCE_COOKIE, "tok", "other.net")];
        assert_eq!(clearance_cookie_value(&cookies, "example.com"), None);
    }

    #[test]
    fn test_clearance_cookie_name_must_match() {
        let cookies = vec![cookie("session", "tok", "example.com")];
        assert_eq!(clearance_cookie_value(&cookies, "example.com"), None);
    }
}
