//! Weather data service
//!
//! Two resilient reads over the JMA open data endpoints:
//!
//! - the area directory (office code to office name), one document cached
//!   under a single key for a day
//! - per-area forecast overviews, cached per area code for a minute
//!
//! A forecast is only requested for area codes present in the directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::SingleFlightCache;
use crate::config::ResilienceConfig;
use crate::deadline::{DeadlineExecutor, WorkerPool};
use crate::error::{FetchError, ResilienceError, Result};
use crate::fetch::Fetcher;
use crate::resilient::ResilientFetch;
use crate::retry::{RetryExecutor, TransientOnly};

/// Area definition document listing the forecast offices.
pub const AREA_DIRECTORY_URL: &str = "https://www.jma.go.jp/bosai/common/const/area.json";

/// Forecast overview document for one office.
pub fn forecast_overview_url(area: &str) -> String {
    format!("https://www.jma.go.jp/bosai/forecast/data/overview_forecast/{area}.json")
}

/// Office code to office name, e.g. `"130000" -> "東京都"`.
pub type AreaDirectory = BTreeMap<String, String>;

/// Forecast overview published for one area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastOverview {
    pub publishing_office: String,
    pub report_datetime: String,
    pub target_area: String,
    #[serde(default)]
    pub headline_text: String,
    pub text: String,
}

/// Parse the area definition document.
///
/// Only the `offices` object is used; a document without it is treated as a
/// soft failure (`Ok(None)`) so the retry policy can try again.
pub fn parse_area_directory(json: &str) -> std::result::Result<Option<AreaDirectory>, FetchError> {
    let document: Value = serde_json::from_str(json)?;
    let Some(offices) = document.get("offices").and_then(Value::as_object) else {
        return Ok(None);
    };

    let directory = offices
        .iter()
        .map(|(code, info)| {
            let name = match info.get("name") {
                Some(Value::String(name)) => name.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            (code.clone(), name)
        })
        .collect();
    Ok(Some(directory))
}

pub fn parse_forecast_overview(json: &str) -> std::result::Result<Option<ForecastOverview>, FetchError> {
    Ok(Some(serde_json::from_str(json)?))
}

/// Adapts a fetcher of raw JSON bodies into a typed fetcher.
pub struct JsonFetcher<F, V> {
    inner: F,
    decode: fn(&str) -> std::result::Result<Option<V>, FetchError>,
}

impl<F, V> JsonFetcher<F, V> {
    pub fn new(inner: F, decode: fn(&str) -> std::result::Result<Option<V>, FetchError>) -> Self {
        Self { inner, decode }
    }
}

#[async_trait]
impl<F, V> Fetcher<V> for JsonFetcher<F, V>
where
    F: Fetcher<String>,
    V: Send + 'static,
{
    async fn fetch(&self, key: &str, cancel: &CancellationToken) -> std::result::Result<Option<V>, FetchError> {
        match self.inner.fetch(key, cancel).await? {
            Some(body) => (self.decode)(&body),
            None => Ok(None),
        }
    }
}

/// Cached, retried access to the area directory and forecast overviews.
#[derive(Debug, Clone)]
pub struct WeatherDataService {
    areas: ResilientFetch<AreaDirectory>,
    forecasts: ResilientFetch<ForecastOverview>,
}

impl WeatherDataService {
    /// Cache key of the area directory.
    pub const AREAS_KEY: &'static str = "areas";

    pub const FETCH_AREAS_POLICY: &'static str = "fetchAvailableAreas";
    pub const FORECAST_POLICY: &'static str = "forecastOverview";
    pub const AREAS_DEADLINE: &'static str = "getAvailableAreas";
    pub const FORECAST_DEADLINE: &'static str = "getWeatherForecast";

    /// `pool` bounds deadline-bound callers. Upstream fetches for both caches
    /// share a separate pool sized by `config.fetch_pool`.
    pub fn new(
        config: &ResilienceConfig,
        pool: WorkerPool,
        areas: Arc<dyn Fetcher<AreaDirectory>>,
        forecasts: Arc<dyn Fetcher<ForecastOverview>>,
    ) -> Result<Self> {
        config.validate()?;
        let fetch_pool = WorkerPool::new(config.fetch_pool)?;

        let areas = ResilientFetch::new(
            areas,
            Self::retry_executor(config, Self::FETCH_AREAS_POLICY)?,
            DeadlineExecutor::new(
                Self::AREAS_DEADLINE,
                config.deadline_for(Self::AREAS_DEADLINE),
                pool.clone(),
            )?,
            SingleFlightCache::new("availableAreas", config.cache.areas_ttl)?
                .with_pool(fetch_pool.clone()),
        );
        let forecasts = ResilientFetch::new(
            forecasts,
            Self::retry_executor(config, Self::FORECAST_POLICY)?,
            DeadlineExecutor::new(
                Self::FORECAST_DEADLINE,
                config.deadline_for(Self::FORECAST_DEADLINE),
                pool,
            )?,
            SingleFlightCache::new("forecastOverview", config.cache.forecast_ttl)?
                .with_pool(fetch_pool),
        );

        Ok(Self { areas, forecasts })
    }

    fn retry_executor(config: &ResilienceConfig, name: &str) -> Result<RetryExecutor> {
        let policy = config.retry_policy(name)?.with_classifier(TransientOnly);
        Ok(RetryExecutor::new(name, policy))
    }

    /// The area directory, or `None` if it could not be fetched.
    pub async fn available_areas(&self) -> Option<AreaDirectory> {
        self.areas.resilient_get(Self::AREAS_KEY).await
    }

    pub async fn is_available_area(&self, area: &str) -> bool {
        self.available_areas()
            .await
            .is_some_and(|areas| areas.contains_key(area))
    }

    /// Forecast overview for `area`.
    ///
    /// Unknown area codes yield `None` without contacting the forecast
    /// upstream or touching the forecast cache.
    pub async fn forecast_overview(&self, area: &str) -> Option<ForecastOverview> {
        if !self.is_available_area(area).await {
            info!(area, "unsupported area code");
            return None;
        }
        self.forecasts.resilient_get(area).await
    }

    pub async fn available_areas_with_deadline(&self) -> Result<AreaDirectory> {
        self.areas.resilient_get_with_deadline(Self::AREAS_KEY).await
    }

    /// [`forecast_overview`](Self::forecast_overview) under the
    /// `getWeatherForecast` deadline, directory lookup included.
    pub async fn forecast_overview_with_deadline(&self, area: &str) -> Result<ForecastOverview> {
        let this = self.clone();
        let key = area.to_string();
        let executor = self.forecasts.deadline();

        let overview = executor
            .run_with_deadline(move |cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    overview = this.forecast_overview(&key) => overview,
                }
            })
            .await?;

        overview.ok_or_else(|| {
            debug!(area, "no forecast overview available");
            ResilienceError::Unavailable {
                operation: executor.operation().to_string(),
            }
        })
    }

    pub fn areas(&self) -> &ResilientFetch<AreaDirectory> {
        &self.areas
    }

    pub fn forecasts(&self) -> &ResilientFetch<ForecastOverview> {
        &self.forecasts
    }
}
