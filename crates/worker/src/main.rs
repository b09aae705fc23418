//! `scanfleet-worker` -- scan files through the configured node fleet.
//!
//! Loads the dispatcher configuration from the environment (see
//! `DispatchConfig::from_env`), connects to every node, then scans each
//! path given on the command line and prints its verdict as JSON.
//!
//! ```text
//! SCAN_NODE_URLS=http://md-1:8008,http://md-2:8008 scanfleet-worker sample.bin
//! ```

use anyhow::Context;
use scanfleet_core::engine::format_definition_time;
use scanfleet_dispatch::{DispatchConfig, ScanDispatcher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanfleet_worker=info,scanfleet_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        anyhow::bail!("usage: scanfleet-worker <file>...");
    }

    let config = DispatchConfig::from_env()?;
    tracing::info!(nodes = ?config.node_urls, "Loaded dispatcher configuration");

    let dispatcher = ScanDispatcher::start(config).await?;

    if let Some((oldest, newest)) = dispatcher.current_definition_range().await {
        tracing::info!(
            oldest = %format_definition_time(&oldest),
            newest = %format_definition_time(&newest),
            "Definition time range",
        );
    }
    tracing::info!(
        fingerprint = %dispatcher.capability_fingerprint().await,
        "Engine fingerprint",
    );

    let mut failures = 0usize;
    for path in &paths {
        let artifact = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {path}"))?;

        match dispatcher.scan(&artifact).await {
            Ok(verdict) => {
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "Scan failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} scans failed", paths.len());
    }
    Ok(())
}
