//! Series Data Models
//!
//! Event entities as stored, ingest inputs, and the values handed back to
//! callers.

use crate::scope::TenantId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ============================================
// Stored Events
// ============================================

/// A recorded storefront visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub ip: Option<String>,
    pub url: String,
    /// Site-wide sentinel when the visit is not attributed to a product
    pub product_code: String,
    pub header: String,
    pub tag: String,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
    pub day: NaiveDate,
}

/// A recorded order; owns its lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Order total in minor currency units
    pub amount_minor: i64,
    pub currency: String,
    pub external_order_id: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub day: NaiveDate,
    pub lines: Vec<OrderLine>,
}

impl Order {
    /// Sum of line quantities
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

/// One line of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: Uuid,
    /// Owning order, by id only
    pub order_id: Uuid,
    pub unit_price_minor: i64,
    pub quantity: i64,
    pub product_code: String,
    pub product_name: String,
}

impl OrderLine {
    pub fn line_total(&self) -> i64 {
        self.unit_price_minor * self.quantity
    }
}

// ============================================
// Ingest Inputs
// ============================================

/// Visit as reported by the tracking layer
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewVisit {
    pub tenant_id: TenantId,
    #[validate(length(max = 45))]
    pub ip: Option<String>,
    #[validate(length(max = 2048))]
    pub url: String,
    /// `None` records a site-wide visit
    #[validate(length(max = 255))]
    pub product_code: Option<String>,
    pub header: String,
    #[validate(length(max = 100))]
    #[serde(default)]
    pub tag: String,
    /// Defaults to the time of recording
    pub created_at: Option<DateTime<Utc>>,
}

impl NewVisit {
    pub fn new(tenant_id: TenantId, url: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            tenant_id,
            ip: None,
            url: url.into(),
            product_code: None,
            header: header.into(),
            tag: String::new(),
            created_at: None,
        }
    }

    pub fn product(mut self, code: impl Into<String>) -> Self {
        self.product_code = Some(code.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Order as reported by the checkout integration
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewOrder {
    pub tenant_id: TenantId,
    #[validate(range(min = 0i64, max = 1_000_000_000_000_000i64))]
    pub amount_minor: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(length(max = 255))]
    pub external_order_id: String,
    #[validate(length(max = 100))]
    #[serde(default)]
    pub tag: String,
    #[validate(nested)]
    #[serde(default)]
    pub lines: Vec<NewOrderLine>,
    /// Defaults to the time of recording
    pub created_at: Option<DateTime<Utc>>,
}

impl NewOrder {
    pub fn new(
        tenant_id: TenantId,
        amount_minor: i64,
        currency: impl Into<String>,
        external_order_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            amount_minor,
            currency: currency.into(),
            external_order_id: external_order_id.into(),
            tag: String::new(),
            lines: Vec::new(),
            created_at: None,
        }
    }

    pub fn line(mut self, line: NewOrderLine) -> Self {
        self.lines.push(line);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Order line as reported by the checkout integration
///
/// The price and quantity ceilings keep every line total inside `i64`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewOrderLine {
    #[validate(range(min = 0i64, max = 1_000_000_000_000i64))]
    pub unit_price_minor: i64,
    #[validate(range(min = 1, max = 1_000_000))]
    pub quantity: i64,
    #[validate(length(max = 255))]
    pub product_code: String,
    #[validate(length(max = 255))]
    pub product_name: String,
}

impl NewOrderLine {
    pub fn new(
        product_code: impl Into<String>,
        product_name: impl Into<String>,
        unit_price_minor: i64,
        quantity: i64,
    ) -> Self {
        Self {
            unit_price_minor,
            quantity,
            product_code: product_code.into(),
            product_name: product_name.into(),
        }
    }
}

// ============================================
// Results
// ============================================

/// One day of a densified series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub day: NaiveDate,
    pub value: i64,
    /// Per-order average for amount and quantity series
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
}

/// Lifetime totals of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantTotals {
    /// Site-wide human visits
    pub visits: i64,
    pub orders: i64,
    pub revenue_minor: i64,
}

/// Best-selling product of a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopProduct {
    pub product_code: String,
    pub name: String,
    /// Number of order lines
    pub lines: i64,
    pub quantity: i64,
    pub average_unit_price: f64,
}

// ============================================
// Forecast Parameters (written externally)
// ============================================

/// Per-tenant model weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreWeights {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub probability_weights: Vec<f64>,
    pub shift: i64,
    pub long_shift: i64,
    pub updated_at: DateTime<Utc>,
}

/// Market indicators imported for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenData {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub store_power: f64,
    pub customer_satisfaction: f64,
    pub maximal_product_price: f64,
    pub minimal_product_price: f64,
    pub perceived_value: f64,
    pub created_at: DateTime<Utc>,
}
