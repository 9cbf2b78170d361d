//! View Aggregation Path
//!
//! Reads the live grouping views (`visit_daily_view`, `order_daily_view`,
//! `order_product_daily_view`) instead of scanning event rows. The views are
//! plain SQL views over the event tables, so they always reflect the current
//! rows; this path only saves re-joining lines to orders per call.

use crate::error::SeriesError;
use crate::scope::{ProductFilter, ScopeFilter};
use crate::source::{DailySeriesSource, DayAggregate, MetricKind, SeriesPath, SparseSeries};
use crate::store::{format_day, parse_day, EventStore};
use async_trait::async_trait;
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, Row};

/// Grouping read from the store views
#[derive(Debug, Clone)]
pub struct ViewAggregator {
    store: EventStore,
}

impl ViewAggregator {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Build the grouped query for a kind. Visit queries select `day` and
    /// `visits`; order queries select `day`, `orders`, `quantity` and `amount`.
    fn build_query<'a>(&self, scope: &ScopeFilter, kind: MetricKind) -> QueryBuilder<'a, Sqlite> {
        let product_code = scope.product().product_code();

        // Order queries sum every column whatever the kind; the raw path
        // checks the same sums.
        let (select, table) = match (kind, product_code) {
            (MetricKind::VisitCount, _) => ("SELECT day, SUM(visits) AS visits", "visit_daily_view"),
            (_, None) => (
                "SELECT day, SUM(orders) AS orders, SUM(quantity) AS quantity, SUM(amount_minor) AS amount",
                "order_daily_view",
            ),
            (_, Some(_)) => (
                "SELECT day, SUM(orders) AS orders, SUM(quantity) AS quantity, SUM(amount_minor) AS amount",
                "order_product_daily_view",
            ),
        };

        let mut query = QueryBuilder::new(select);
        query.push(" FROM ");
        query.push(table);
        query.push(" WHERE tenant_id = ");
        query.push_bind(scope.tenant().as_key());
        query.push(" AND day >= ");
        query.push_bind(format_day(scope.from()));
        query.push(" AND day <= ");
        query.push_bind(format_day(scope.to()));

        if let Some(tag) = scope.tag() {
            query.push(" AND tag = ");
            query.push_bind(tag.to_string());
        }

        if kind == MetricKind::VisitCount {
            if scope.excludes_bots() {
                query.push(" AND is_bot = 0");
            }
            match scope.product() {
                ProductFilter::Any => {}
                ProductFilter::SiteWide => {
                    query.push(" AND product_code = ");
                    query.push_bind(self.store.settings().site_wide_sentinel.clone());
                }
                ProductFilter::Product(code) => {
                    query.push(" AND product_code = ");
                    query.push_bind(code.clone());
                }
            }
        } else if let Some(code) = product_code {
            query.push(" AND product_code = ");
            query.push_bind(code.to_string());
        }

        query.push(" GROUP BY day ORDER BY day");
        query
    }
}

#[async_trait]
impl DailySeriesSource for ViewAggregator {
    fn path(&self) -> SeriesPath {
        SeriesPath::View
    }

    async fn compute_daily(&self, scope: &ScopeFilter, kind: MetricKind) -> Result<SparseSeries, SeriesError> {
        let scope = &scope.resolve_sentinel(&self.store.settings().site_wide_sentinel);
        let mut query = self.build_query(scope, kind);
        let rows = self.store.bounded(query.build().fetch_all(self.store.pool())).await?;

        let mut series = SparseSeries::new(kind, self.store.timezone());
        for row in &rows {
            let day = parse_day(&row.try_get::<String, _>("day")?)?;
            let aggregate = match kind {
                MetricKind::VisitCount => {
                    let visits: i64 = row.try_get("visits")?;
                    DayAggregate::new(visits, visits)
                }
                MetricKind::OrderCount => {
                    let orders: i64 = row.try_get("orders")?;
                    DayAggregate::new(orders, orders)
                }
                MetricKind::OrderQuantity => DayAggregate::new(row.try_get("quantity")?, row.try_get("orders")?),
                MetricKind::OrderAmount => DayAggregate::new(row.try_get("amount")?, row.try_get("orders")?),
            };
            // Groups whose every row was filtered out never reach here, so a
            // zero-event row would mean a corrupt view.
            if aggregate.events > 0 {
                series.add(day, aggregate)?;
            }
        }

        tracing::debug!(
            tenant_id = %scope.tenant(),
            kind = %kind,
            path = "view",
            days = series.len(),
            "Computed sparse series"
        );
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{NewOrder, NewOrderLine, NewVisit};
    use crate::scope::TenantId;
    use chrono::{NaiveDate, TimeZone, Utc};

    const HUMAN: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) Safari/605.1.15";

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn at(d: u32, h: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_view_reflects_new_rows_immediately() {
        let store = EventStore::in_memory(&EngineConfig::default()).await.unwrap();
        let view = ViewAggregator::new(store.clone());
        let tenant = TenantId::generate();
        let scope = ScopeFilter::new(tenant, date(1), date(3)).unwrap();

        assert!(view.compute_daily(&scope, MetricKind::VisitCount).await.unwrap().is_empty());

        store.record_visit(NewVisit::new(tenant, "/", HUMAN).at(at(2, 8))).await.unwrap();
        let series = view.compute_daily(&scope, MetricKind::VisitCount).await.unwrap();
        assert_eq!(series.get(date(2)), Some(&DayAggregate::new(1, 1)));
    }

    #[tokio::test]
    async fn test_product_view_excludes_site_wide_visits() {
        let store = EventStore::in_memory(&EngineConfig::default()).await.unwrap();
        let view = ViewAggregator::new(store.clone());
        let tenant = TenantId::generate();

        store.record_visit(NewVisit::new(tenant, "/", HUMAN).at(at(1, 8))).await.unwrap();
        store
            .record_visit(NewVisit::new(tenant, "/p/mug", HUMAN).product("MUG").at(at(2, 8)))
            .await
            .unwrap();

        let scope = ScopeFilter::new(tenant, date(1), date(3))
            .unwrap()
            .with_product(ProductFilter::Product("MUG".into()));
        let series = view.compute_daily(&scope, MetricKind::VisitCount).await.unwrap();

        assert_eq!(series.get(date(1)), None);
        assert_eq!(series.get(date(2)).map(|d| d.value), Some(1));
    }

    #[tokio::test]
    async fn test_order_product_view_counts_distinct_orders() {
        let store = EventStore::in_memory(&EngineConfig::default()).await.unwrap();
        let view = ViewAggregator::new(store.clone());
        let tenant = TenantId::generate();

        store
            .record_order(
                NewOrder::new(tenant, 900, "EUR", "a")
                    .line(NewOrderLine::new("MUG", "Mug", 300, 1))
                    .line(NewOrderLine::new("MUG", "Mug (gift wrap)", 300, 2))
                    .at(at(2, 8)),
            )
            .await
            .unwrap();

        let scope = ScopeFilter::new(tenant, date(2), date(2))
            .unwrap()
            .with_product(ProductFilter::Product("MUG".into()));

        let count = view.compute_daily(&scope, MetricKind::OrderCount).await.unwrap();
        let quantity = view.compute_daily(&scope, MetricKind::OrderQuantity).await.unwrap();
        assert_eq!(count.get(date(2)), Some(&DayAggregate::new(1, 1)));
        assert_eq!(quantity.get(date(2)), Some(&DayAggregate::new(3, 1)));
    }
}
