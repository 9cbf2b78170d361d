//! Raw Aggregation Path
//!
//! Scans the event rows matching a scope on every call and buckets them by
//! calendar day in Rust. Day truncation and crawler detection are evaluated
//! here from the raw timestamp and header, independently of the derived
//! columns the view path reads.

use crate::calendar::utc_bounds;
use crate::error::SeriesError;
use crate::scope::{ProductFilter, ScopeFilter};
use crate::source::{DailySeriesSource, DayAggregate, MetricKind, SeriesPath, SparseSeries};
use crate::store::{from_micros, to_micros, EventStore};
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, Row};
use std::collections::{BTreeMap, BTreeSet};

/// Order-based value carried by a series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderMeasure {
    Count,
    Quantity,
    Amount,
}

impl OrderMeasure {
    fn of(kind: MetricKind) -> Option<Self> {
        match kind {
            MetricKind::VisitCount => None,
            MetricKind::OrderCount => Some(OrderMeasure::Count),
            MetricKind::OrderQuantity => Some(OrderMeasure::Quantity),
            MetricKind::OrderAmount => Some(OrderMeasure::Amount),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            OrderMeasure::Count => MetricKind::OrderCount,
            OrderMeasure::Quantity => MetricKind::OrderQuantity,
            OrderMeasure::Amount => MetricKind::OrderAmount,
        }
    }
}

/// Per-call grouping over event rows
#[derive(Debug, Clone)]
pub struct Aggregator {
    store: EventStore,
}

impl Aggregator {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Open a query with the tenant and time predicates shared by every kind
    fn scoped_query<'a>(&self, select: &str, table: &str, scope: &ScopeFilter) -> QueryBuilder<'a, Sqlite> {
        let (start, end) = utc_bounds(scope.from(), scope.to(), self.store.timezone());

        let mut query = QueryBuilder::new(select);
        query.push(" WHERE ");
        query.push(table);
        query.push(".tenant_id = ");
        query.push_bind(scope.tenant().as_key());
        query.push(" AND ");
        query.push(table);
        query.push(".created_at >= ");
        query.push_bind(to_micros(start));
        query.push(" AND ");
        query.push(table);
        query.push(".created_at < ");
        query.push_bind(to_micros(end));

        if let Some(tag) = scope.tag() {
            query.push(" AND ");
            query.push(table);
            query.push(".tag = ");
            query.push_bind(tag.to_string());
        }

        query
    }

    async fn visit_counts(&self, scope: &ScopeFilter) -> Result<SparseSeries, SeriesError> {
        let settings = self.store.settings();
        let mut query = self.scoped_query("SELECT v.created_at, v.header FROM visits v", "v", scope);

        match scope.product() {
            ProductFilter::Any => {}
            ProductFilter::SiteWide => {
                query.push(" AND v.product_code = ");
                query.push_bind(settings.site_wide_sentinel.clone());
            }
            ProductFilter::Product(code) => {
                query.push(" AND v.product_code = ");
                query.push_bind(code.clone());
            }
        }

        let rows = self.store.bounded(query.build().fetch_all(self.store.pool())).await?;

        let mut series = SparseSeries::new(MetricKind::VisitCount, settings.timezone);
        for row in &rows {
            let header: String = row.try_get("header")?;
            if scope.excludes_bots() && settings.bots.matches(&header) {
                continue;
            }
            let day = settings.day_of(from_micros(row.try_get("created_at")?)?);
            if scope.contains(day) {
                series.add(day, DayAggregate::new(1, 1))?;
            }
        }
        Ok(series)
    }

    async fn whole_orders(&self, scope: &ScopeFilter, measure: OrderMeasure) -> Result<SparseSeries, SeriesError> {
        let settings = self.store.settings();
        let mut query = self.scoped_query(
            "SELECT o.id, o.created_at, o.amount_minor,
                    (SELECT COALESCE(SUM(l.quantity), 0) FROM order_lines l WHERE l.order_id = o.id) AS quantity
             FROM orders o",
            "o",
            scope,
        );
        query.push(" ORDER BY o.created_at");

        let rows = self.store.bounded(query.build().fetch_all(self.store.pool())).await?;

        let mut by_day: BTreeMap<NaiveDate, DayOrders> = BTreeMap::new();
        for row in &rows {
            let day = settings.day_of(from_micros(row.try_get("created_at")?)?);
            if !scope.contains(day) {
                continue;
            }
            by_day
                .entry(day)
                .or_default()
                .absorb(row.try_get("id")?, row.try_get("quantity")?, row.try_get("amount_minor")?)
                .ok_or_else(|| SeriesError::ValueOverflow(format!("orders on {}", day)))?;
        }

        series_of(measure, settings.timezone, by_day)
    }

    async fn product_orders(
        &self,
        scope: &ScopeFilter,
        measure: OrderMeasure,
        product_code: &str,
    ) -> Result<SparseSeries, SeriesError> {
        let settings = self.store.settings();
        let mut query = self.scoped_query(
            "SELECT o.id, o.created_at, l.quantity, l.unit_price_minor
             FROM order_lines l JOIN orders o ON o.id = l.order_id",
            "o",
            scope,
        );
        query.push(" AND l.product_code = ");
        query.push_bind(product_code.to_string());

        let rows = self.store.bounded(query.build().fetch_all(self.store.pool())).await?;

        let mut by_day: BTreeMap<NaiveDate, DayOrders> = BTreeMap::new();
        for row in &rows {
            let day = settings.day_of(from_micros(row.try_get("created_at")?)?);
            if !scope.contains(day) {
                continue;
            }
            let overflow = || SeriesError::ValueOverflow(format!("{} lines on {}", product_code, day));

            let quantity: i64 = row.try_get("quantity")?;
            let unit_price: i64 = row.try_get("unit_price_minor")?;
            let line_total = unit_price.checked_mul(quantity).ok_or_else(overflow)?;

            by_day
                .entry(day)
                .or_default()
                .absorb(row.try_get("id")?, quantity, line_total)
                .ok_or_else(overflow)?;
        }

        series_of(measure, settings.timezone, by_day)
    }
}

/// Orders of one day; quantity and amount are both checked whatever the measure,
/// matching the view path, which sums both columns.
#[derive(Default)]
struct DayOrders {
    orders: BTreeSet<String>,
    quantity: i64,
    amount: i64,
}

impl DayOrders {
    fn absorb(&mut self, order_id: String, quantity: i64, amount: i64) -> Option<()> {
        self.quantity = self.quantity.checked_add(quantity)?;
        self.amount = self.amount.checked_add(amount)?;
        self.orders.insert(order_id);
        Some(())
    }
}

fn series_of(
    measure: OrderMeasure,
    timezone: Tz,
    by_day: BTreeMap<NaiveDate, DayOrders>,
) -> Result<SparseSeries, SeriesError> {
    let mut series = SparseSeries::new(measure.kind(), timezone);
    for (day, totals) in by_day {
        let orders = totals.orders.len() as i64;
        let value = match measure {
            OrderMeasure::Count => orders,
            OrderMeasure::Quantity => totals.quantity,
            OrderMeasure::Amount => totals.amount,
        };
        series.add(day, DayAggregate::new(value, orders))?;
    }
    Ok(series)
}

#[async_trait]
impl DailySeriesSource for Aggregator {
    fn path(&self) -> SeriesPath {
        SeriesPath::Raw
    }

    async fn compute_daily(&self, scope: &ScopeFilter, kind: MetricKind) -> Result<SparseSeries, SeriesError> {
        let scope = &scope.resolve_sentinel(&self.store.settings().site_wide_sentinel);
        let series = match (OrderMeasure::of(kind), scope.product()) {
            (None, _) => self.visit_counts(scope).await?,
            (Some(measure), ProductFilter::Product(code)) => {
                self.product_orders(scope, measure, code).await?
            }
            // Orders are not attributed to a product themselves; the site-wide
            // rule only narrows visits.
            (Some(measure), ProductFilter::Any | ProductFilter::SiteWide) => {
                self.whole_orders(scope, measure).await?
            }
        };

        tracing::debug!(
            tenant_id = %scope.tenant(),
            kind = %kind,
            path = "raw",
            days = series.len(),
            "Computed sparse series"
        );
        Ok(series)
    }
}
