//! StorePulse Series Engine
//!
//! Calendar-day aggregation core for StorePulse retail analytics providing:
//! - Per-tenant daily visit and order series over an inclusive date range
//! - Two interchangeable computation paths (raw rows and live grouping views)
//! - Gap-free densification with explicit zero days
//! - Scalar aggregates (sum, average, counts, lifetime totals, top products)
//! - Read-only access to forecasting parameters
//!
//! # Configuration
//!
//! All configuration is loaded from environment variables:
//! - `DATABASE_URL` - SQLite connection string (default: `sqlite::memory:`)
//! - `SERIES_TIMEZONE` - IANA zone for day truncation (default: `UTC`)
//! - `SERIES_BOT_SIGNATURES` - Comma-separated crawler signatures
//! - `SERIES_SITE_WIDE_SENTINEL` - Product code of site-wide visits (default: empty)
//! - `SERIES_STORE_TIMEOUT_MS` - Per-call store timeout (default: 5000)
//! - `SERIES_MAX_CONNECTIONS` - Pool size for file-backed stores (default: 5)
//!
//! # Usage
//!
//! ```rust,ignore
//! use storepulse_series::{EngineConfig, MetricKind, ScopeFilter, SeriesEngine, SeriesPath};
//!
//! let engine = SeriesEngine::connect(EngineConfig::from_env()?).await?;
//! let scope = ScopeFilter::parse(tenant_id, from, to)?;
//! let series = engine.daily_series(&scope, MetricKind::VisitCount, SeriesPath::View).await?;
//! ```

pub mod aggregator;
pub mod calendar;
pub mod config;
pub mod densify;
pub mod error;
pub mod forecast;
pub mod models;
pub mod scalar;
pub mod scope;
pub mod source;
pub mod store;
pub mod view;

// Re-export commonly used types
pub use aggregator::Aggregator;
pub use calendar::CalendarRange;
pub use config::EngineConfig;
pub use densify::Densifier;
pub use error::SeriesError;
pub use forecast::ForecastInputs;
pub use models::*;
pub use scalar::{EventKind, ScalarAggregator};
pub use scope::{ProductFilter, ScopeFilter, ScopeRequest, TenantId};
pub use source::{DailySeriesSource, DayAggregate, MetricKind, SeriesPath, SparseSeries};
pub use store::EventStore;
pub use view::ViewAggregator;

use std::time::Duration;

/// Entry point wiring the store, both series paths, densification and scalars
#[derive(Debug, Clone)]
pub struct SeriesEngine {
    config: EngineConfig,
    store: EventStore,
    raw: Aggregator,
    view: ViewAggregator,
    densifier: Densifier,
    scalars: ScalarAggregator,
    forecast: ForecastInputs,
}

impl SeriesEngine {
    /// Open the configured store and build the engine on it
    pub async fn connect(config: EngineConfig) -> Result<Self, SeriesError> {
        let store = EventStore::connect(&config).await?;
        Ok(Self::from_store(config, store))
    }

    /// Build the engine on an already opened store
    pub fn from_store(config: EngineConfig, store: EventStore) -> Self {
        tracing::info!(
            timezone = %store.timezone(),
            timeout_ms = store.timeout().as_millis() as u64,
            "Series engine ready"
        );

        Self {
            raw: Aggregator::new(store.clone()),
            view: ViewAggregator::new(store.clone()),
            densifier: Densifier::new(store.timezone()),
            scalars: ScalarAggregator::new(store.clone()),
            forecast: ForecastInputs::new(store.clone()),
            config,
            store,
        }
    }

    /// Same engine with a caller-supplied bound on every store call
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let store = self.store.with_timeout(timeout);
        Self {
            raw: Aggregator::new(store.clone()),
            view: ViewAggregator::new(store.clone()),
            densifier: self.densifier,
            scalars: ScalarAggregator::new(store.clone()),
            forecast: ForecastInputs::new(store.clone()),
            config: self.config.clone(),
            store,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn scalars(&self) -> &ScalarAggregator {
        &self.scalars
    }

    pub fn forecast(&self) -> &ForecastInputs {
        &self.forecast
    }

    pub fn densifier(&self) -> &Densifier {
        &self.densifier
    }

    /// Series source implementing `path`
    pub fn source(&self, path: SeriesPath) -> &dyn DailySeriesSource {
        match path {
            SeriesPath::Raw => &self.raw,
            SeriesPath::View => &self.view,
        }
    }

    /// Build a scope from a request using the configured site-wide sentinel
    pub fn scope_from_request(&self, request: ScopeRequest) -> Result<ScopeFilter, SeriesError> {
        request.into_scope(&self.store.settings().site_wide_sentinel)
    }

    /// Complete daily series for a scope; densifies only a complete sparse result
    pub async fn daily_series(
        &self,
        scope: &ScopeFilter,
        kind: MetricKind,
        path: SeriesPath,
    ) -> Result<Vec<DailyMetric>, SeriesError> {
        let sparse = self.source(path).compute_daily(scope, kind).await.map_err(|e| {
            tracing::warn!(tenant_id = %scope.tenant(), kind = %kind, path = %path, error = %e, "Series computation failed");
            e
        })?;
        self.densifier.densify(scope, &sparse)
    }

    /// Run both paths and fail when they disagree
    pub async fn cross_check(&self, scope: &ScopeFilter, kind: MetricKind) -> Result<Vec<DailyMetric>, SeriesError> {
        let (raw, view) = tokio::try_join!(
            self.raw.compute_daily(scope, kind),
            self.view.compute_daily(scope, kind)
        )?;

        if let Some(day) = raw.first_difference(&view) {
            let detail = format!(
                "{} on {}: raw {:?}, view {:?}",
                scope.tenant(),
                day,
                raw.get(day),
                view.get(day)
            );
            tracing::error!(kind = %kind, detail = %detail, "Series paths diverge");
            return Err(SeriesError::PathDivergence { kind, detail });
        }

        self.densifier.densify(scope, &raw)
    }
}
