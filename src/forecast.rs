//! Forecast Inputs
//!
//! Read-only access to the per-tenant forecasting parameters. The rows are
//! written by the external model-fitting job; this crate never modifies them.

use crate::error::SeriesError;
use crate::models::{OpenData, StoreWeights};
use crate::scope::TenantId;
use crate::store::{from_micros, parse_tenant, EventStore};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Reader for forecasting parameters
#[derive(Debug, Clone)]
pub struct ForecastInputs {
    store: EventStore,
}

impl ForecastInputs {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Most recently updated weights of a tenant
    pub async fn store_weights(&self, tenant: TenantId) -> Result<Option<StoreWeights>, SeriesError> {
        let row = self
            .store
            .bounded(
                sqlx::query(
                    "SELECT * FROM store_weights WHERE tenant_id = ?1
                     ORDER BY updated_at DESC, id LIMIT 1",
                )
                .bind(tenant.as_key())
                .fetch_optional(self.store.pool()),
            )
            .await?;

        row.as_ref().map(weights_from_row).transpose()
    }

    /// Imported market indicators of a tenant, oldest first
    pub async fn open_data(&self, tenant: TenantId) -> Result<Vec<OpenData>, SeriesError> {
        let rows = self
            .store
            .bounded(
                sqlx::query("SELECT * FROM open_data WHERE tenant_id = ?1 ORDER BY created_at, id")
                    .bind(tenant.as_key())
                    .fetch_all(self.store.pool()),
            )
            .await?;

        rows.iter().map(open_data_from_row).collect()
    }
}

fn parse_id(row: &SqliteRow) -> Result<Uuid, SeriesError> {
    let raw: String = row.try_get("id")?;
    Uuid::parse_str(&raw).map_err(|_| SeriesError::StoreUnavailable(format!("stored id {:?} is malformed", raw)))
}

fn weights_from_row(row: &SqliteRow) -> Result<StoreWeights, SeriesError> {
    let raw_weights: String = row.try_get("probability_weights")?;
    let probability_weights: Vec<f64> = serde_json::from_str(&raw_weights).map_err(|e| {
        tracing::warn!(error = %e, "Malformed probability weights");
        SeriesError::StoreUnavailable(format!("probability weights are not a JSON array of numbers: {}", e))
    })?;

    Ok(StoreWeights {
        id: parse_id(row)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id")?)?,
        name: row.try_get("name")?,
        beta: row.try_get("beta")?,
        gamma: row.try_get("gamma")?,
        delta: row.try_get("delta")?,
        a: row.try_get("a")?,
        b: row.try_get("b")?,
        c: row.try_get("c")?,
        d: row.try_get("d")?,
        e: row.try_get("e")?,
        probability_weights,
        shift: row.try_get("shift")?,
        long_shift: row.try_get("long_shift")?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn open_data_from_row(row: &SqliteRow) -> Result<OpenData, SeriesError> {
    Ok(OpenData {
        id: parse_id(row)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id")?)?,
        store_power: row.try_get("store_power")?,
        customer_satisfaction: row.try_get("customer_satisfaction")?,
        maximal_product_price: row.try_get("maximal_product_price")?,
        minimal_product_price: row.try_get("minimal_product_price")?,
        perceived_value: row.try_get("perceived_value")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}
