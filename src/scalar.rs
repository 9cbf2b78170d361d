//! Scalar Aggregation
//!
//! Single-value aggregates over a scope. No densification happens here; an
//! empty match yields `0` for every scalar, the same as data that sums to
//! zero.

use crate::error::SeriesError;
use crate::models::{TenantTotals, TopProduct};
use crate::scope::{ProductFilter, ScopeFilter, TenantId};
use crate::store::{format_day, parse_day, to_micros, EventStore};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, Row};

/// Event table a count runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Visit,
    Order,
}

/// Amount sum and order count of a scope
#[derive(Debug, Clone, Copy, Default)]
struct AmountTotals {
    amount: i64,
    orders: i64,
}

/// Scalar aggregates over the event store
#[derive(Debug, Clone)]
pub struct ScalarAggregator {
    store: EventStore,
}

impl ScalarAggregator {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Tenant, day range and tag predicates on an order or visit alias
    ///
    /// Filters on the stored `day` column, which connect keeps reconciled with
    /// the configured zone, not on `created_at` bounds like the raw path.
    fn push_scope(query: &mut QueryBuilder<'_, Sqlite>, alias: &str, scope: &ScopeFilter) {
        query.push(" WHERE ");
        query.push(alias);
        query.push(".tenant_id = ");
        query.push_bind(scope.tenant().as_key());
        query.push(" AND ");
        query.push(alias);
        query.push(".day >= ");
        query.push_bind(format_day(scope.from()));
        query.push(" AND ");
        query.push(alias);
        query.push(".day <= ");
        query.push_bind(format_day(scope.to()));

        if let Some(tag) = scope.tag() {
            query.push(" AND ");
            query.push(alias);
            query.push(".tag = ");
            query.push_bind(tag.to_string());
        }
    }

    async fn amount_totals(&self, scope: &ScopeFilter) -> Result<AmountTotals, SeriesError> {
        let scope = &scope.resolve_sentinel(&self.store.settings().site_wide_sentinel);
        let mut query: QueryBuilder<'_, Sqlite> = match scope.product() {
            ProductFilter::Product(_) => QueryBuilder::new(
                "SELECT COALESCE(SUM(l.unit_price_minor * l.quantity), 0) AS amount,
                        COUNT(DISTINCT o.id) AS orders
                 FROM order_lines l JOIN orders o ON o.id = l.order_id",
            ),
            ProductFilter::Any | ProductFilter::SiteWide => QueryBuilder::new(
                "SELECT COALESCE(SUM(o.amount_minor), 0) AS amount, COUNT(*) AS orders FROM orders o",
            ),
        };
        Self::push_scope(&mut query, "o", scope);
        if let Some(code) = scope.product().product_code() {
            query.push(" AND l.product_code = ");
            query.push_bind(code.to_string());
        }

        let row = self.store.bounded(query.build().fetch_one(self.store.pool())).await?;
        Ok(AmountTotals {
            amount: row.try_get("amount")?,
            orders: row.try_get("orders")?,
        })
    }

    /// Order amount in minor units; `0` when nothing matches
    pub async fn sum_amount(&self, scope: &ScopeFilter) -> Result<i64, SeriesError> {
        Ok(self.amount_totals(scope).await?.amount)
    }

    /// Mean order amount in minor units; `0` when nothing matches
    pub async fn average_amount(&self, scope: &ScopeFilter) -> Result<f64, SeriesError> {
        let totals = self.amount_totals(scope).await?;
        if totals.orders == 0 {
            return Ok(0.0);
        }
        Ok(totals.amount as f64 / totals.orders as f64)
    }

    /// Number of matching visits or orders
    pub async fn count(&self, scope: &ScopeFilter, events: EventKind) -> Result<i64, SeriesError> {
        let scope = &scope.resolve_sentinel(&self.store.settings().site_wide_sentinel);
        let mut query: QueryBuilder<'_, Sqlite> = match (events, scope.product()) {
            (EventKind::Visit, _) => QueryBuilder::new("SELECT COUNT(*) AS total FROM visits v"),
            (EventKind::Order, ProductFilter::Product(_)) => QueryBuilder::new(
                "SELECT COUNT(DISTINCT o.id) AS total FROM order_lines l JOIN orders o ON o.id = l.order_id",
            ),
            (EventKind::Order, _) => QueryBuilder::new("SELECT COUNT(*) AS total FROM orders o"),
        };

        match events {
            EventKind::Visit => {
                Self::push_scope(&mut query, "v", scope);
                if scope.excludes_bots() {
                    query.push(" AND v.is_bot = 0");
                }
                match scope.product() {
                    ProductFilter::Any => {}
                    ProductFilter::SiteWide => {
                        query.push(" AND v.product_code = ");
                        query.push_bind(self.store.settings().site_wide_sentinel.clone());
                    }
                    ProductFilter::Product(code) => {
                        query.push(" AND v.product_code = ");
                        query.push_bind(code.clone());
                    }
                }
            }
            EventKind::Order => {
                Self::push_scope(&mut query, "o", scope);
                if let Some(code) = scope.product().product_code() {
                    query.push(" AND l.product_code = ");
                    query.push_bind(code.to_string());
                }
            }
        }

        let row = self.store.bounded(query.build().fetch_one(self.store.pool())).await?;
        Ok(row.try_get("total")?)
    }

    /// Earliest visit day of a tenant, used to bound forecast windows
    pub async fn first_event_day(&self, tenant: TenantId) -> Result<Option<NaiveDate>, SeriesError> {
        let row = self
            .store
            .bounded(
                sqlx::query("SELECT MIN(day) AS first_day FROM visits WHERE tenant_id = ?1")
                    .bind(tenant.as_key())
                    .fetch_one(self.store.pool()),
            )
            .await?;

        match row.try_get::<Option<String>, _>("first_day")? {
            Some(raw) => Ok(Some(parse_day(&raw)?)),
            None => Ok(None),
        }
    }

    /// Orders created strictly before `instant`
    pub async fn orders_before(&self, tenant: TenantId, instant: DateTime<Utc>) -> Result<i64, SeriesError> {
        let row = self
            .store
            .bounded(
                sqlx::query("SELECT COUNT(*) AS total FROM orders WHERE tenant_id = ?1 AND created_at < ?2")
                    .bind(tenant.as_key())
                    .bind(to_micros(instant))
                    .fetch_one(self.store.pool()),
            )
            .await?;
        Ok(row.try_get("total")?)
    }

    /// All-time site-wide human visits, order count and revenue
    pub async fn lifetime_totals(&self, tenant: TenantId) -> Result<TenantTotals, SeriesError> {
        let row = self
            .store
            .bounded(
                sqlx::query(
                    r#"
                    SELECT
                        (SELECT COUNT(*) FROM visits
                         WHERE tenant_id = ?1 AND product_code = ?2 AND is_bot = 0) AS visits,
                        (SELECT COUNT(*) FROM orders WHERE tenant_id = ?1) AS orders,
                        (SELECT COALESCE(SUM(amount_minor), 0) FROM orders WHERE tenant_id = ?1) AS revenue
                    "#,
                )
                .bind(tenant.as_key())
                .bind(&self.store.settings().site_wide_sentinel)
                .fetch_one(self.store.pool()),
            )
            .await?;

        Ok(TenantTotals {
            visits: row.try_get("visits")?,
            orders: row.try_get("orders")?,
            revenue_minor: row.try_get("revenue")?,
        })
    }

    /// Best-selling products by number of order lines
    pub async fn top_products(
        &self,
        tenant: TenantId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TopProduct>, SeriesError> {
        let rows = self
            .store
            .bounded(
                sqlx::query(
                    r#"
                    SELECT l.product_code,
                           MAX(l.product_name) AS name,
                           COUNT(*) AS lines,
                           SUM(l.quantity) AS quantity,
                           AVG(l.unit_price_minor) AS average_unit_price
                    FROM order_lines l
                    JOIN orders o ON o.id = l.order_id
                    WHERE o.tenant_id = ?1
                    GROUP BY l.product_code
                    ORDER BY lines DESC, l.product_code
                    LIMIT ?2 OFFSET ?3
                    "#,
                )
                .bind(tenant.as_key())
                .bind(limit.clamp(0, 1000))
                .bind(offset.max(0))
                .fetch_all(self.store.pool()),
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<TopProduct, SeriesError> {
                Ok(TopProduct {
                    product_code: row.try_get("product_code")?,
                    name: row.try_get("name")?,
                    lines: row.try_get("lines")?,
                    quantity: row.try_get("quantity")?,
                    average_unit_price: row.try_get("average_unit_price")?,
                })
            })
            .collect()
    }
}
