//! End-to-end read scenarios against the weather service with scripted upstreams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_fetch::config::RetryConfig;
use resilient_fetch::retry::{self, RetryExecutionResult};
use resilient_fetch::weather::{AreaDirectory, ForecastOverview};
use resilient_fetch::{
    Backoff, ConfigBuilder, FetchError, Fetcher, FnFetcher, ResilienceConfig, RetryPolicy,
    WeatherDataService, WorkerPool,
};
use tokio::time::{advance, sleep, Instant};
use tokio_util::sync::CancellationToken;

fn tokyo() -> AreaDirectory {
    AreaDirectory::from([("130000".to_string(), "Tokyo".to_string())])
}

fn overview(area: &str) -> ForecastOverview {
    ForecastOverview {
        publishing_office: "気象庁".into(),
        report_datetime: "2022-09-28T04:42:00+09:00".into(),
        target_area: area.into(),
        headline_text: String::new(),
        text: "sunny".into(),
    }
}

fn area_fetcher(calls: Arc<AtomicUsize>) -> Arc<dyn Fetcher<AreaDirectory>> {
    Arc::new(FnFetcher::new(move |_key: String, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, FetchError>(Some(tokyo())) }
    }))
}

fn forecast_fetcher(
    calls: Arc<AtomicUsize>,
    fail: bool,
    latency: Duration,
) -> Arc<dyn Fetcher<ForecastOverview>> {
    Arc::new(FnFetcher::new(move |key: String, _cancel: CancellationToken| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(latency).await;
            if fail {
                Err(FetchError::Status { code: 503 })
            } else {
                Ok(Some(overview(&key)))
            }
        }
    }))
}

fn service(
    config: &ResilienceConfig,
    areas: Arc<dyn Fetcher<AreaDirectory>>,
    forecasts: Arc<dyn Fetcher<ForecastOverview>>,
) -> WeatherDataService {
    let pool = WorkerPool::new(config.pool).unwrap();
    WeatherDataService::new(config, pool, areas, forecasts).unwrap()
}

fn single_attempt() -> RetryConfig {
    RetryConfig {
        max_attempts: 1,
        ..RetryConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn area_directory_is_cached_for_a_day() {
    let area_calls = Arc::new(AtomicUsize::new(0));
    let config = ConfigBuilder::new().build().unwrap();
    let svc = service(
        &config,
        area_fetcher(area_calls.clone()),
        forecast_fetcher(Arc::new(AtomicUsize::new(0)), false, Duration::ZERO),
    );

    assert_eq!(svc.available_areas().await, Some(tokyo()));
    assert_eq!(area_calls.load(Ordering::SeqCst), 1);

    advance(Duration::from_secs(3600)).await;
    assert_eq!(svc.available_areas().await, Some(tokyo()));
    assert_eq!(area_calls.load(Ordering::SeqCst), 1);

    advance(Duration::from_secs(24 * 3600)).await;
    assert_eq!(svc.available_areas().await, Some(tokyo()));
    assert_eq!(area_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn unsupported_area_never_reaches_forecast_upstream() {
    let forecast_calls = Arc::new(AtomicUsize::new(0));
    let config = ConfigBuilder::new().build().unwrap();
    let svc = service(
        &config,
        area_fetcher(Arc::new(AtomicUsize::new(0))),
        forecast_fetcher(forecast_calls.clone(), false, Duration::ZERO),
    );

    assert!(!svc.is_available_area("999999").await);
    assert_eq!(svc.forecast_overview("999999").await, None);
    assert_eq!(forecast_calls.load(Ordering::SeqCst), 0);
    assert_eq!(svc.forecasts().cache_stats().misses, 0);

    let err = svc.forecast_overview_with_deadline("999999").await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test(start_paused = true)]
async fn failed_forecast_is_cached_for_its_ttl() {
    let forecast_calls = Arc::new(AtomicUsize::new(0));
    let config = ConfigBuilder::new()
        .retry_override(WeatherDataService::FORECAST_POLICY, single_attempt())
        .forecast_ttl(Duration::from_secs(60))
        .build()
        .unwrap();
    let svc = service(
        &config,
        area_fetcher(Arc::new(AtomicUsize::new(0))),
        forecast_fetcher(forecast_calls.clone(), true, Duration::ZERO),
    );

    assert_eq!(svc.forecast_overview("130000").await, None);
    assert_eq!(forecast_calls.load(Ordering::SeqCst), 1);

    advance(Duration::from_secs(1)).await;
    assert_eq!(svc.forecast_overview("130000").await, None);
    advance(Duration::from_secs(29)).await;
    assert_eq!(svc.forecast_overview("130000").await, None);
    assert_eq!(forecast_calls.load(Ordering::SeqCst), 1);

    advance(Duration::from_secs(31)).await;
    assert_eq!(svc.forecast_overview("130000").await, None);
    assert_eq!(forecast_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn deadline_separates_timeout_from_success() {
    let config = ConfigBuilder::new()
        .retry_override(WeatherDataService::FORECAST_POLICY, single_attempt())
        .deadline_override(WeatherDataService::FORECAST_DEADLINE, Duration::from_millis(100))
        .build()
        .unwrap();
    let svc = service(
        &config,
        area_fetcher(Arc::new(AtomicUsize::new(0))),
        forecast_fetcher(Arc::new(AtomicUsize::new(0)), false, Duration::from_millis(500)),
    );

    let start = Instant::now();
    let err = svc.forecast_overview_with_deadline("130000").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_millis(150));

    // the abandoned fetch completes in the background and fills the cache
    sleep(Duration::from_millis(500)).await;
    let got = svc.forecast_overview_with_deadline("130000").await.unwrap();
    assert_eq!(got.target_area, "130000");
}

#[tokio::test(start_paused = true)]
async fn generous_deadline_returns_value() {
    let config = ConfigBuilder::new()
        .deadline_override(WeatherDataService::FORECAST_DEADLINE, Duration::from_millis(1000))
        .build()
        .unwrap();
    let svc = service(
        &config,
        area_fetcher(Arc::new(AtomicUsize::new(0))),
        forecast_fetcher(Arc::new(AtomicUsize::new(0)), false, Duration::from_millis(500)),
    );

    let got = svc.forecast_overview_with_deadline("130000").await.unwrap();
    assert_eq!(got, overview("130000"));
    assert_eq!(svc.available_areas_with_deadline().await.unwrap(), tokyo());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_absorbed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_cl = calls.clone();
    let flaky: Arc<dyn Fetcher<ForecastOverview>> =
        Arc::new(FnFetcher::new(move |key: String, _cancel: CancellationToken| {
            let n = calls_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(FetchError::Injected),
                    1 => Ok(None),
                    _ => Ok(Some(overview(&key))),
                }
            }
        }));
    let config = ConfigBuilder::new().build().unwrap();
    let svc = service(&config, area_fetcher(Arc::new(AtomicUsize::new(0))), flaky);

    assert_eq!(svc.forecast_overview("130000").await, Some(overview("130000")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn decode_errors_are_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_cl = calls.clone();
    let broken: Arc<dyn Fetcher<ForecastOverview>> =
        Arc::new(FnFetcher::new(move |_key: String, _cancel: CancellationToken| {
            calls_cl.fetch_add(1, Ordering::SeqCst);
            async {
                let err = serde_json::from_str::<ForecastOverview>("{").unwrap_err();
                Err::<Option<ForecastOverview>, _>(FetchError::from(err))
            }
        }));
    let config = ConfigBuilder::new().build().unwrap();
    let svc = service(&config, area_fetcher(Arc::new(AtomicUsize::new(0))), broken);

    assert_eq!(svc.forecast_overview("130000").await, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_delays_follow_backoff_curve() {
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let stamps_cl = stamps.clone();
    let policy = RetryPolicy::new(
        3,
        Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(1)),
    )
    .unwrap();

    let out: RetryExecutionResult<u32, FetchError> = retry::execute(
        move || {
            let mut stamps = stamps_cl.lock().unwrap();
            stamps.push(Instant::now());
            let n = stamps.len();
            async move {
                if n < 3 {
                    Err(FetchError::Status { code: 500 })
                } else {
                    Ok(Some(7))
                }
            }
        },
        &policy,
    )
    .await;

    assert_eq!(out.into_option(), Some(7));
    let stamps = stamps.lock().unwrap();
    assert_eq!(stamps.len(), 3);
    let first_gap = stamps[1] - stamps[0];
    let second_gap = stamps[2] - stamps[1];
    assert!(first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(105));
    assert!(second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(205));
    assert!(second_gap > first_gap);
}

#[tokio::test(start_paused = true)]
async fn always_failing_operation_uses_every_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_cl = calls.clone();
    let policy = RetryPolicy::new(4, Backoff::fixed(Duration::from_millis(10))).unwrap();

    let out: RetryExecutionResult<u32, FetchError> = retry::execute(
        move || {
            calls_cl.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Transport("connection reset".into())) }
        },
        &policy,
    )
    .await;

    assert!(!out.is_value());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn timed_out_forecast_reads_do_not_starve_the_pool() {
    let config = ConfigBuilder::new()
        .pool(1, 1)
        .retry_override(WeatherDataService::FORECAST_POLICY, single_attempt())
        .deadline_override(WeatherDataService::FORECAST_DEADLINE, Duration::from_millis(100))
        .deadline_override(WeatherDataService::AREAS_DEADLINE, Duration::from_millis(100))
        .build()
        .unwrap();
    let pool = WorkerPool::new(config.pool).unwrap();
    let svc = WeatherDataService::new(
        &config,
        pool.clone(),
        area_fetcher(Arc::new(AtomicUsize::new(0))),
        forecast_fetcher(Arc::new(AtomicUsize::new(0)), false, Duration::from_secs(30)),
    )
    .unwrap();

    assert_eq!(svc.available_areas_with_deadline().await.unwrap(), tokyo());
    for _ in 0..2 {
        let err = svc.forecast_overview_with_deadline("130000").await.unwrap_err();
        assert!(err.is_timeout());
    }

    sleep(Duration::from_millis(1)).await;
    assert_eq!(pool.admitted(), 0);
    assert_eq!(svc.available_areas_with_deadline().await.unwrap(), tokyo());
}

#[tokio::test(start_paused = true)]
async fn burst_beyond_pool_capacity_queues_instead_of_failing() {
    let forecast_calls = Arc::new(AtomicUsize::new(0));
    let config = ConfigBuilder::new()
        .pool(1, 0)
        .deadline_override(WeatherDataService::FORECAST_DEADLINE, Duration::from_secs(1))
        .build()
        .unwrap();
    let svc = service(
        &config,
        area_fetcher(Arc::new(AtomicUsize::new(0))),
        forecast_fetcher(forecast_calls.clone(), false, Duration::from_millis(10)),
    );

    let readers = (0..8).map(|_| {
        let svc = svc.clone();
        tokio::spawn(async move { svc.forecast_overview_with_deadline("130000").await })
    });
    for reader in futures::future::join_all(readers).await {
        assert_eq!(reader.unwrap().unwrap(), overview("130000"));
    }
    assert_eq!(forecast_calls.load(Ordering::SeqCst), 1);
}
