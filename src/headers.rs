//! Header filtering policies and out-of-band request replay
//!
//! When the engine replays a browser request outside the browser's own
//! network stack, the header set it sends is part of the wire contract:
//! origin-side bot heuristics key on exactly which headers arrive. Two
//! symmetric policies cover the two known-good fingerprints — a narrow
//! allow-list of navigation headers, and a block-list that strips only the
//! headers that give the embedded engine away.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::metrics::global_metrics;

/// Headers kept by [`HeaderPolicy::Allow`]. Lower-cased; matching is
/// case-insensitive.
const ALLOWED_HEADERS: &[&str] = &[
    "upgrade-insecure-requests",
    "user-agent",
    "accept",
    "sec-fetch-dest",
    "sec-fetch-site",
    "accept-language",
    "sec-fetch-mode",
    "cookie",
    "referer",
    "origin",
];

/// Headers dropped by [`HeaderPolicy::Block`]. Client-hint headers and
/// `x-requested-with` commonly trigger bot detection.
const BLOCKED_HEADERS: &[&str] = &["sec-ch-ua", "sec-ch-ua-full-version-list", "x-requested-with"];

/// Navigation defaults synthesized after allow-list filtering. The embedded
/// engine does not expose these on intercepted requests even though a real
/// navigation sends them.
const SYNTHESIZED_DEFAULTS: &[(&str, &str)] = &[
    ("accept-language", "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7"),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-user", "?1"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
];

/// Which filtering policy to apply before replaying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderPolicy {
    /// Keep only navigation-relevant headers, synthesize missing defaults.
    #[default]
    Allow,
    /// Keep everything except the known fingerprint headers.
    Block,
}

impl HeaderPolicy {
    /// Apply this policy to a raw header set. Pure: the input is never
    /// mutated, kept headers retain their original casing.
    pub fn filter(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        match self {
            HeaderPolicy::Allow => filter_allowlist(headers),
            HeaderPolicy::Block => filter_blocklist(headers),
        }
    }
}

/// Keep only headers whose lower-cased name is in the allowed set, then
/// synthesize browser-plausible defaults for the navigation headers the
/// engine never exposes.
pub fn filter_allowlist(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let mut filtered: HashMap<String, String> = headers
        .iter()
        .filter(|(name, _)| ALLOWED_HEADERS.contains(&name.to_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    for (name, value) in SYNTHESIZED_DEFAULTS {
        if !contains_name(&filtered, name) {
            filtered.insert((*name).to_string(), (*value).to_string());
        }
    }

    filtered
}

/// Keep every header except the fixed blocked set.
pub fn filter_blocklist(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !BLOCKED_HEADERS.contains(&name.to_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn contains_name(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Flatten a CDP header object into name/value pairs. The protocol models
/// headers as a JSON object; non-string values are serialized verbatim.
pub(crate) fn cdp_headers_to_map(
    headers: &chromiumoxide::cdp::browser_protocol::network::Headers,
) -> HashMap<String, String> {
    headers
        .inner()
        .as_object()
        .map(|object| {
            object
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Mime type and charset parsed from a `Content-Type` header value.
/// Absent or malformed input falls back to `text/html` / `UTF-8`.
pub fn parse_content_type(value: Option<&str>) -> (String, String) {
    let Some(value) = value else {
        return ("text/html".to_string(), "UTF-8".to_string());
    };

    let mut parts = value.split(';');
    let mime = match parts.next().map(str::trim) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => "text/html".to_string(),
    };
    let charset = parts
        .find_map(|p| {
            let p = p.trim();
            if p.len() >= 8 && p[..8].eq_ignore_ascii_case("charset=") {
                Some(p[8..].trim().to_string())
            } else {
                None
            }
        })
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "UTF-8".to_string());

    (mime, charset)
}

/// A response reconstructed from an out-of-band replay, ready to be handed
/// back to the browser engine in place of its own fetch.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    /// HTTP status code
    pub status: u16,
    /// Mime type from `Content-Type` (default `text/html`)
    pub mime_type: String,
    /// Charset from `Content-Type` (default `UTF-8`)
    pub charset: String,
    /// Response headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

/// Issues the engine's own independent HTTP requests mirroring method and
/// URL of an intercepted browser request, with policy-filtered headers.
///
/// Replays never run under the surface lock and carry their own 15 s
/// connect/read timeouts. Any I/O failure yields `None` so the browser's
/// default handling proceeds.
#[derive(Debug, Clone)]
pub struct ReplayClient {
    client: reqwest::Client,
}

const REPLAY_TIMEOUT: Duration = Duration::from_secs(15);

impl ReplayClient {
    /// Build the replay client. Failure here is an unrecoverable setup
    /// fault and propagates, unlike replay-time faults.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(REPLAY_TIMEOUT)
            .timeout(REPLAY_TIMEOUT)
            .build()
            .map_err(|e| Error::generic(format!("replay client init failed: {e}")))?;
        Ok(Self { client })
    }

    /// Replay `method url` with the already-filtered header set.
    ///
    /// POST requests are never replayed — the page may depend on the body
    /// and on engine-internal state, so they fall through to native
    /// handling. Returns `None` on any transient fault.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn replay(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Option<ReplayResponse> {
        if method.eq_ignore_ascii_case("POST") {
            debug!("skipping POST replay");
            return None;
        }

        let method = reqwest::Method::from_bytes(method.as_bytes()).ok()?;
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            header_map.insert(name, value);
        }

        let result = async {
            let response = self
                .client
                .request(method, url)
                .headers(header_map)
                .send()
                .await?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response.bytes().await?.to_vec();

            let (mime_type, charset) = parse_content_type(content_type.as_deref());
            Ok::<_, reqwest::Error>(ReplayResponse {
                status,
                mime_type,
                charset,
                headers,
                body,
            })
        }
        .await;

        match result {
            Ok(response) => {
                global_metrics().record_replay(true);
                Some(response)
            }
            Err(e) => {
                // Transient fault: fall back to the engine's own handling.
                debug!("replay failed, falling through: {e}");
                global_metrics().record_replay(false);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_allowlist_keeps_only_allowed() {
        let input = headers(&[
            ("User-Agent", "Mozilla/5.0"),
            ("Cookie", "cf_clearance=abc"),
            ("X-Requested-With", "app.id"),
            ("Sec-Ch-Ua", "\"Chromium\";v=120"),
        ]);
        let out = filter_allowlist(&input);
        assert!(out.contains_key("User-Agent"));
        assert!(out.contains_key("Cookie"));
        assert!(!out.contains_key("X-Requested-With"));
        assert!(!out.contains_key("Sec-Ch-Ua"));
    }

    #[test]
    fn test_allowlist_synthesizes_defaults() {
        let out = filter_allowlist(&headers(&[("Accept", "text/html")]));
        assert_eq!(
            out.get("accept-language").map(String::as_str),
            Some("fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7")
        );
        assert_eq!(out.get("sec-fetch-dest").map(String::as_str), Some("document"));
        assert_eq!(out.get("sec-fetch-user").map(String::as_str), Some("?1"));
        assert_eq!(out.get("sec-fetch-mode").map(String::as_str), Some("navigate"));
        assert_eq!(out.get("sec-fetch-site").map(String::as_str), Some("none"));
    }

    #[test]
    fn test_allowlist_does_not_overwrite_present_headers() {
        let out = filter_allowlist(&headers(&[("Accept-Language", "ja-JP,ja;q=0.9")]));
        assert_eq!(
            out.get("Accept-Language").map(String::as_str),
            Some("ja-JP,ja;q=0.9")
        );
        assert!(!out.contains_key("accept-language"));
    }

    #[test]
    fn test_blocklist_drops_exactly_blocked() {
        let input = headers(&[
            ("Sec-Ch-Ua", "\"Chromium\";v=120"),
            ("SEC-CH-UA-FULL-VERSION-LIST", "x"),
            ("x-requested-with", "app.id"),
            ("User-Agent", "Mozilla/5.0"),
            ("Accept", "*/*"),
        ]);
        let out = filter_blocklist(&input);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("User-Agent"));
        assert!(out.contains_key("Accept"));
    }

    #[test]
    fn test_filter_does_not_mutate_input() {
        let input = headers(&[("Sec-Ch-Ua", "x"), ("Accept", "*/*")]);
        let before = input.clone();
        let _ = filter_allowlist(&input);
        let _ = filter_blocklist(&input);
        assert_eq!(input, before);
    }

    #[test]
    fn test_parse_content_type_full() {
        let (mime, charset) = parse_content_type(Some("text/html; charset=iso-8859-1"));
        assert_eq!(mime, "text/html");
        assert_eq!(charset, "iso-8859-1");
    }

    #[test]
    fn test_parse_content_type_absent() {
        let (mime, charset) = parse_content_type(None);
        assert_eq!(mime, "text/html");
        assert_eq!(charset, "UTF-8");
    }

    #[test]
    fn test_parse_content_type_no_charset() {
        let (mime, charset) = parse_content_type(Some("application/json"));
        assert_eq!(mime, "application/json");
        assert_eq!(charset, "UTF-8");
    }

    #[test]
    fn test_parse_content_type_malformed() {
        let (mime, charset) = parse_content_type(Some(";;"));
        assert_eq!(mime, "text/html");
        assert_eq!(charset, "UTF-8");
    }

    #[test]
    fn test_parse_content_type_charset_case_insensitive() {
        let (_, charset) = parse_content_type(Some("text/css; Charset=UTF-16"));
        assert_eq!(charset, "UTF-16");
    }
}
