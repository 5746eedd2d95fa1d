//! Header policy tests
//!
//! The header sets are wire contract: origin-side bot heuristics key on
//! exactly which names survive filtering. These tests pin the fixed sets
//! and the synthesized navigation defaults, including property-based
//! checks over arbitrary header maps.

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sekisho::headers::{filter_allowlist, filter_blocklist, parse_content_type, HeaderPolicy};

const ALLOWED: &[&str] = &[
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

const BLOCKED: &[&str] = &["sec-ch-ua", "sec-ch-ua-full-version-list", "x-requested-with"];

const SYNTHESIZED: &[&str] = &[
    "accept-language",
    "sec-fetch-dest",
    "sec-fetch-user",
    "sec-fetch-mode",
    "sec-fetch-site",
];

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn allowlist_keeps_every_allowed_header() {
    let input: HashMap<String, String> = ALLOWED
        .iter()
        .map(|name| (name.to_string(), "value".to_string()))
        .collect();
    let out = filter_allowlist(&input);
    for name in ALLOWED {
        assert!(out.contains_key(*name), "{name} should survive");
    }
}

#[test]
fn allowlist_is_case_insensitive() {
    let out = filter_allowlist(&headers(&[
        ("USER-AGENT", "Mozilla/5.0"),
        ("Referer", "https://example.com"),
        ("X-CUSTOM", "nope"),
    ]));
    assert!(out.contains_key("USER-AGENT"));
    assert!(out.contains_key("Referer"));
    assert!(!out.keys().any(|k| k.eq_ignore_ascii_case("x-custom")));
}

#[test]
fn allowlist_always_yields_navigation_defaults() {
    let out = filter_allowlist(&HashMap::new());
    for name in SYNTHESIZED {
        assert!(
            out.keys().any(|k| k.eq_ignore_ascii_case(name)),
            "{name} must be synthesized"
        );
    }
}

#[test]
fn blocklist_retains_everything_but_blocked() {
    let input = headers(&[
        ("User-Agent", "Mozilla/5.0"),
        ("Accept", "*/*"),
        ("Cookie", "a=b"),
        ("Sec-Ch-Ua", "x"),
        ("sec-ch-ua-full-version-list", "y"),
        ("X-Requested-With", "z"),
        ("X-Anything-Else", "kept"),
    ]);
    let out = filter_blocklist(&input);
    assert_eq!(out.len(), 4);
    assert!(out.contains_key("X-Anything-Else"));
    for name in BLOCKED {
        assert!(!out.keys().any(|k| k.eq_ignore_ascii_case(name)));
    }
}

#[test]
fn policy_dispatch_matches_free_functions() {
    let input = headers(&[("Accept", "*/*"), ("Sec-Ch-Ua", "x")]);
    assert_eq!(HeaderPolicy::Allow.filter(&input), filter_allowlist(&input));
    assert_eq!(HeaderPolicy::Block.filter(&input), filter_blocklist(&input));
}

#[test]
fn content_type_defaults_when_absent_or_malformed() {
    assert_eq!(
        parse_content_type(None),
        ("text/html".to_string(), "UTF-8".to_string())
    );
    assert_eq!(
        parse_content_type(Some("")),
        ("text/html".to_string(), "UTF-8".to_string())
    );
    assert_eq!(
        parse_content_type(Some("; charset=")),
        ("text/html".to_string(), "UTF-8".to_string())
    );
}

#[test]
fn content_type_parses_mime_and_charset() {
    assert_eq!(
        parse_content_type(Some("application/json; charset=utf-8")),
        ("application/json".to_string(), "utf-8".to_string())
    );
}

// ============================================================================
// PROPERTY-BASED CHECKS
// ============================================================================

/// Strategy for plausible header names, mixing allowed, blocked, and noise
fn arb_header_name() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::sample::select(ALLOWED.to_vec()).prop_map(str::to_string),
        prop::sample::select(BLOCKED.to_vec()).prop_map(str::to_string),
        "[A-Za-z][A-Za-z0-9-]{0,18}",
    ]
}

fn arb_headers() -> impl Strategy<Value = HashMap<String, String>> {
    prop::collection::hash_map(arb_header_name(), "[ -~]{0,30}", 0..12)
}

proptest! {
    #[test]
    fn prop_allowlist_subset_of_allowed_plus_synthesized(input in arb_headers()) {
        let out = filter_allowlist(&input);
        for name in out.keys() {
            let lower = name.to_lowercase();
            prop_assert!(
                ALLOWED.contains(&lower.as_str()) || SYNTHESIZED.contains(&lower.as_str()),
                "unexpected header survived: {name}"
            );
        }
    }

    #[test]
    fn prop_allowlist_defaults_always_present(input in arb_headers()) {
        let out = filter_allowlist(&input);
        for name in SYNTHESIZED {
            prop_assert!(out.keys().any(|k| k.eq_ignore_ascii_case(name)));
        }
    }

    #[test]
    fn prop_blocklist_complement(input in arb_headers()) {
        let out = filter_blocklist(&input);
        for (name, value) in &input {
            let blocked = BLOCKED.contains(&name.to_lowercase().as_str());
            if blocked {
                prop_assert!(!out.contains_key(name));
            } else {
                prop_assert_eq!(out.get(name), Some(value));
            }
        }
    }

    #[test]
    fn prop_filters_never_mutate_input(input in arb_headers()) {
        let before = input.clone();
        let _ = filter_allowlist(&input);
        let _ = filter_blocklist(&input);
        prop_assert_eq!(input, before);
    }

    #[test]
    fn prop_kept_values_unchanged_by_allowlist(input in arb_headers()) {
        let out = filter_allowlist(&input);
        for (name, value) in &input {
            if ALLOWED.contains(&name.to_lowercase().as_str()) {
                prop_assert_eq!(out.get(name), Some(value));
            }
        }
    }
}
