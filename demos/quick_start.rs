//! # sekisho - Quick Start Example
//!
//! Walks through the three driving operations against a live page.
//! Requires a local Chrome/Chromium installation.
//!
//! Run with: `cargo run --example quick-start`

use sekisho::{ClearanceConfig, Engine, HeaderPolicy, InterceptionConfig, SurfaceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sekisho=debug".into()),
        )
        .init();

    let engine = Engine::with_config(SurfaceConfig::builder().headless(true).build())?;

    // 1. Evaluate a script against a loaded page
    let title = engine
        .evaluator()
        .evaluate(
            Some("https://example.com"),
            "document.title",
            15_000,
            false,
        )
        .await?;
    println!("page title: {title:?}");

    // 2. Capture the requests the page makes while loading
    let config = InterceptionConfig {
        timeout_ms: Some(10_000),
        max_requests: Some(20),
        ..Default::default()
    };
    let capture = engine
        .interceptor()
        .intercept("https://example.com", &config, |req| {
            req.method == "GET"
        })
        .await?;
    println!(
        "captured {} requests, completion: {:?}",
        capture.requests.len(),
        capture.reason
    );

    // 3. Attempt a challenge clearance with header rewriting
    let clearance = engine
        .clearance()
        .resolve(
            "https://example.com",
            &ClearanceConfig {
                timeout_ms: Some(20_000),
                header_mode: Some(HeaderPolicy::Allow),
                ..Default::default()
            },
        )
        .await?;
    println!("clearance outcome: {clearance:?}");

    println!("{}", sekisho::metrics::global_metrics().to_prometheus_format());

    engine.close().await;
    Ok(())
}
