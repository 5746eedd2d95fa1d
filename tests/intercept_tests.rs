//! Interception type tests
//!
//! These exercise the capture data model and config surface. Full capture
//! sessions require a running Chrome/Chromium instance and live in the
//! demos.

use std::collections::HashMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use regex::Regex;
use sekisho::{
    CompletionReason, InterceptedRequest, InterceptionConfig, RequestInterceptor, SurfaceManager,
};

fn sample_request() -> InterceptedRequest {
    let mut headers = HashMap::new();
    headers.insert("User-Agent".to_string(), "Mozilla/5.0".to_string());
    headers.insert("Accept".to_string(), "*/*".to_string());
    InterceptedRequest {
        url: "https://reader.example.com/ajax/read/12?vrf=AbC123&x=1".to_string(),
        method: "GET".to_string(),
        headers,
        timestamp: 1_722_000_000_000,
        body: None,
    }
}

#[test]
fn intercepted_request_accessor_round_trip() {
    let request = sample_request();
    assert_eq!(request.method, "GET");
    assert_eq!(
        request.url,
        "https://reader.example.com/ajax/read/12?vrf=AbC123&x=1"
    );
    assert_eq!(request.timestamp, 1_722_000_000_000);
    assert_eq!(
        request.headers.get("User-Agent").map(String::as_str),
        Some("Mozilla/5.0")
    );
    assert_eq!(request.body, None);
}

#[test]
fn intercepted_request_serde_round_trip() {
    let request = sample_request();
    let json = serde_json::to_string(&request).expect("serialize");
    let back: InterceptedRequest = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, request);
}

#[test]
fn vrf_token_extraction_from_query() {
    let request = InterceptedRequest {
        url: "/ajax/read/12?vrf=AbC123&x=1".to_string(),
        method: "GET".to_string(),
        headers: HashMap::new(),
        timestamp: 0,
        body: None,
    };
    assert_eq!(request.query_param("vrf"), Some("AbC123".to_string()));
}

#[test]
fn vrf_token_is_percent_decoded() {
    let request = InterceptedRequest {
        url: "/ajax/read/7?vrf=a%2Bb%2Fc%3D%3D".to_string(),
        method: "GET".to_string(),
        headers: HashMap::new(),
        timestamp: 0,
        body: None,
    };
    assert_eq!(request.query_param("vrf"), Some("a+b/c==".to_string()));
}

#[test]
fn url_matching_is_substring_style() {
    let request = sample_request();
    let pattern = Regex::new(r"/ajax/read/\d+").expect("pattern");
    assert!(request.url_matches(&pattern));

    let miss = Regex::new(r"/chapter/\d+").expect("pattern");
    assert!(!request.url_matches(&miss));
}

#[test]
fn interception_config_defaults() {
    let config = InterceptionConfig::default();
    assert!(config.timeout_ms.is_none());
    assert!(config.max_requests.is_none());
    assert!(config.url_pattern.is_none());
    assert!(config.page_script.is_none());
}

#[test]
fn completion_reason_wire_names() {
    let reasons = [
        (CompletionReason::Timeout, "\"timeout\""),
        (CompletionReason::MaxReached, "\"max-reached\""),
        (CompletionReason::ManualStop, "\"manual-stop\""),
        (CompletionReason::Error, "\"error\""),
    ];
    for (reason, expected) in reasons {
        assert_eq!(serde_json::to_string(&reason).expect("serialize"), expected);
    }
}

#[test]
fn stop_handle_is_cloneable_and_sticky() {
    // No browser needed: constructing the interceptor is lazy.
    let interceptor = RequestInterceptor::new(Arc::new(SurfaceManager::new()));
    let handle = interceptor.stop_handle();
    let clone = handle.clone();
    clone.stop();
    // Stopping twice is harmless
    handle.stop();
}
