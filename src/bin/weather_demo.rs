//! Weather service against a simulated, flaky upstream.
//!
//! Usage: `weather_demo [config.toml]`. Without a file the configuration is
//! read from `RESILIENCE_*` environment variables. Set `RUST_LOG` to adjust
//! verbosity, e.g. `RUST_LOG=resilient_fetch=trace`.

use std::sync::Arc;
use std::time::Duration;

use resilient_fetch::config;
use resilient_fetch::weather::{
    parse_area_directory, parse_forecast_overview, JsonFetcher, AREA_DIRECTORY_URL,
};
use resilient_fetch::{FaultInjector, FetchError, FnFetcher, WeatherDataService, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AREA_DOCUMENT: &str = r#"{
    "offices": {
        "016000": { "name": "石狩・空知・後志地方" },
        "130000": { "name": "東京都" },
        "140000": { "name": "神奈川県" },
        "270000": { "name": "大阪府" }
    }
}"#;

fn overview_document(area: &str) -> String {
    serde_json::json!({
        "publishingOffice": "気象庁",
        "reportDatetime": "2022-09-28T04:42:00+09:00",
        "targetArea": area,
        "headlineText": "",
        "text": format!("simulated overview for {area}"),
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,resilient_fetch=debug")),
        )
        .with_target(false)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => config::from_file(path)?,
        None => config::from_env()?,
    };
    info!(pool = ?config.pool, fetch_pool = ?config.fetch_pool, deadline = ?config.deadline.timeout, "loaded configuration");

    let areas_upstream = FaultInjector::new(FnFetcher::<_, String>::new(
        |_url: String, _cancel: CancellationToken| async {
            Ok::<_, FetchError>(Some(AREA_DOCUMENT.to_string()))
        },
    ))
    .with_max_latency(Duration::from_millis(50));

    let forecast_upstream = FaultInjector::new(FnFetcher::<_, String>::new(
        |area: String, _cancel: CancellationToken| async move {
            Ok::<_, FetchError>(Some(overview_document(&area)))
        },
    ))
    .with_max_latency(Duration::from_millis(400));

    let pool = WorkerPool::new(config.pool)?;
    let service = WeatherDataService::new(
        &config,
        pool,
        Arc::new(JsonFetcher::new(areas_upstream, parse_area_directory)),
        Arc::new(JsonFetcher::new(forecast_upstream, parse_forecast_overview)),
    )?;

    println!("=== Weather demo ===");
    println!("area directory: {AREA_DIRECTORY_URL} (simulated)\n");

    match service.available_areas_with_deadline().await {
        Ok(areas) => println!("{} forecast offices available", areas.len()),
        Err(e) => println!("area directory unavailable: {e}"),
    }

    for round in 1..=3 {
        println!("\n--- round {round} ---");
        let requests = ["130000", "140000", "130000", "270000", "999999", "130000"];
        let readers = requests.iter().map(|&area| {
            let service = service.clone();
            tokio::spawn(async move { (area, service.forecast_overview_with_deadline(area).await) })
        });

        for reader in futures::future::join_all(readers).await {
            let (area, outcome) = reader?;
            match outcome {
                Ok(overview) => println!("{area}: {} / {}", overview.target_area, overview.text),
                Err(e) if e.is_timeout() => warn!(area, "timed out: {e}"),
                Err(e) => warn!(area, "no forecast: {e}"),
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let stats = service.forecasts().cache_stats();
    println!(
        "\nforecast cache: {} hits, {} coalesced, {} computations (hit rate {:.0}%)",
        stats.hits,
        stats.coalesced,
        stats.misses,
        stats.hit_rate() * 100.0
    );

    Ok(())
}
