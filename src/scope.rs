//! Query Scope
//!
//! A [`ScopeFilter`] bounds every aggregation: one tenant, an inclusive range
//! of calendar days, and optional product, tag and crawler rules. It is
//! validated on construction and immutable afterwards.

use crate::calendar::CalendarRange;
use crate::error::SeriesError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

// ============================================
// Tenant
// ============================================

/// Identifier of a store; events of different tenants never mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh tenant id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Hyphenated form, as stored in the event tables
    pub fn as_key(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl FromStr for TenantId {
    type Err = SeriesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(SeriesError::InvalidTenant(s.to_string()));
        }
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|_| SeriesError::InvalidTenant(s.to_string()))
    }
}

impl TryFrom<String> for TenantId {
    type Error = SeriesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.as_key()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// ============================================
// Product rule
// ============================================

/// Product dimension of a scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ProductFilter {
    /// No restriction on the product dimension
    #[default]
    Any,
    /// Only events not attributed to any product
    SiteWide,
    /// Only events attributed to this product code
    Product(String),
}

impl ProductFilter {
    /// Interpret an optional product code; the site-wide sentinel selects [`ProductFilter::SiteWide`]
    pub fn from_code(code: Option<&str>, site_wide_sentinel: &str) -> Self {
        match code {
            None => ProductFilter::Any,
            Some(code) if code == site_wide_sentinel => ProductFilter::SiteWide,
            Some(code) => ProductFilter::Product(code.to_string()),
        }
    }

    /// Same rule with a product code equal to the sentinel read as [`ProductFilter::SiteWide`]
    pub fn resolve(&self, site_wide_sentinel: &str) -> ProductFilter {
        match self {
            ProductFilter::Product(code) if code == site_wide_sentinel => ProductFilter::SiteWide,
            other => other.clone(),
        }
    }

    pub fn product_code(&self) -> Option<&str> {
        match self {
            ProductFilter::Product(code) => Some(code),
            _ => None,
        }
    }
}

// ============================================
// Scope filter
// ============================================

/// Validated query dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeFilter {
    tenant: TenantId,
    from: NaiveDate,
    to: NaiveDate,
    product: ProductFilter,
    tag: Option<String>,
    exclude_bots: bool,
}

impl ScopeFilter {
    /// Scope over `[from, to]` with no product or tag restriction and crawler exclusion on
    pub fn new(tenant: TenantId, from: NaiveDate, to: NaiveDate) -> Result<Self, SeriesError> {
        if from > to {
            return Err(SeriesError::InvalidRange { from, to });
        }

        Ok(Self {
            tenant,
            from,
            to,
            product: ProductFilter::Any,
            tag: None,
            exclude_bots: true,
        })
    }

    /// Parse the tenant id and build the scope
    pub fn parse(tenant: &str, from: NaiveDate, to: NaiveDate) -> Result<Self, SeriesError> {
        Self::new(tenant.parse()?, from, to)
    }

    pub fn with_product(mut self, product: ProductFilter) -> Self {
        self.product = product;
        self
    }

    /// Scope whose product rule treats the site-wide sentinel as site-wide, never as a product
    pub fn resolve_sentinel(&self, site_wide_sentinel: &str) -> Self {
        self.clone().with_product(self.product.resolve(site_wide_sentinel))
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_bot_exclusion(mut self, exclude_bots: bool) -> Self {
        self.exclude_bots = exclude_bots;
        self
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn to(&self) -> NaiveDate {
        self.to
    }

    pub fn product(&self) -> &ProductFilter {
        &self.product
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn excludes_bots(&self) -> bool {
        self.exclude_bots
    }

    /// Calendar days covered by the scope
    pub fn calendar(&self) -> CalendarRange {
        CalendarRange::new(self.from, self.to)
    }

    /// Number of days covered by the scope (always at least one)
    pub fn day_count(&self) -> usize {
        self.calendar().len()
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }
}

// ============================================
// Request DTO
// ============================================

/// Deserializable scope request as received from callers
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ScopeRequest {
    /// Checked by parsing into [`TenantId`], never by the validator
    pub tenant_id: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[validate(length(max = 255))]
    pub product_code: Option<String>,
    #[validate(length(max = 100))]
    pub tag: Option<String>,
    pub include_bots: Option<bool>,
}

impl ScopeRequest {
    /// Validate the request and build the scope
    pub fn into_scope(self, site_wide_sentinel: &str) -> Result<ScopeFilter, SeriesError> {
        let tenant: TenantId = self.tenant_id.parse()?;
        self.validate()?;

        let product = ProductFilter::from_code(self.product_code.as_deref(), site_wide_sentinel);
        let mut scope = ScopeFilter::new(tenant, self.from, self.to)?
            .with_product(product)
            .with_bot_exclusion(!self.include_bots.unwrap_or(false));

        if let Some(tag) = self.tag {
            scope = scope.with_tag(tag);
        }

        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_scope_rejects_inverted_range() {
        let result = ScopeFilter::new(TenantId::generate(), date(2024, 3, 2), date(2024, 3, 1));
        assert!(matches!(result, Err(SeriesError::InvalidRange { .. })));
    }

    #[test]
    fn test_scope_rejects_malformed_tenant() {
        for raw in ["", "   ", "store-42", "not-a-uuid-at-all"] {
            let result = ScopeFilter::parse(raw, date(2024, 3, 1), date(2024, 3, 1));
            assert!(
                matches!(result, Err(SeriesError::InvalidTenant(_))),
                "accepted tenant {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_scope_defaults() {
        let scope = ScopeFilter::new(TenantId::generate(), date(2024, 3, 1), date(2024, 3, 1)).unwrap();
        assert_eq!(scope.product(), &ProductFilter::Any);
        assert_eq!(scope.tag(), None);
        assert!(scope.excludes_bots());
        assert_eq!(scope.day_count(), 1);
    }

    #[test]
    fn test_product_filter_from_code() {
        assert_eq!(ProductFilter::from_code(None, ""), ProductFilter::Any);
        assert_eq!(ProductFilter::from_code(Some(""), ""), ProductFilter::SiteWide);
        assert_eq!(ProductFilter::from_code(Some("-"), "-"), ProductFilter::SiteWide);
        assert_eq!(
            ProductFilter::from_code(Some("SKU-1"), ""),
            ProductFilter::Product("SKU-1".into())
        );
    }

    #[test]
    fn test_scope_request_into_scope() {
        let tenant = TenantId::generate();
        let request: ScopeRequest = serde_json::from_value(serde_json::json!({
            "tenant_id": tenant.to_string(),
            "from": "2024-03-01",
            "to": "2024-03-31",
            "product_code": "",
            "tag": "newsletter",
            "include_bots": true
        }))
        .unwrap();

        let scope = request.into_scope("").unwrap();
        assert_eq!(scope.tenant(), tenant);
        assert_eq!(scope.product(), &ProductFilter::SiteWide);
        assert_eq!(scope.tag(), Some("newsletter"));
        assert!(!scope.excludes_bots());
        assert_eq!(scope.day_count(), 31);
    }

    #[test]
    fn test_scope_request_empty_tenant() {
        let request = ScopeRequest {
            tenant_id: String::new(),
            from: date(2024, 3, 1),
            to: date(2024, 3, 1),
            product_code: None,
            tag: None,
            include_bots: None,
        };

        assert!(matches!(request.into_scope(""), Err(SeriesError::InvalidTenant(_))));
    }

    #[test]
    fn test_scope_request_long_tenant_is_invalid_tenant() {
        let request = ScopeRequest {
            tenant_id: "x".repeat(65),
            from: date(2024, 3, 1),
            to: date(2024, 3, 1),
            product_code: Some("y".repeat(300)),
            tag: None,
            include_bots: None,
        };

        assert!(matches!(request.into_scope(""), Err(SeriesError::InvalidTenant(_))));
    }

    #[test]
    fn test_scope_request_validates_after_tenant() {
        let request = ScopeRequest {
            tenant_id: TenantId::generate().to_string(),
            from: date(2024, 3, 1),
            to: date(2024, 3, 1),
            product_code: Some("y".repeat(300)),
            tag: None,
            include_bots: None,
        };

        assert!(matches!(request.into_scope(""), Err(SeriesError::Validation(_))));
    }

    #[test]
    fn test_sentinel_product_resolves_to_site_wide() {
        let scope = ScopeFilter::new(TenantId::generate(), date(2024, 3, 1), date(2024, 3, 3))
            .unwrap()
            .with_product(ProductFilter::Product(String::new()))
            .with_tag("ads");

        let resolved = scope.resolve_sentinel("");
        assert_eq!(resolved.product(), &ProductFilter::SiteWide);
        assert_eq!(resolved.tag(), Some("ads"));
        assert_eq!(
            ProductFilter::Product("MUG".into()).resolve(""),
            ProductFilter::Product("MUG".into())
        );
        assert_eq!(ProductFilter::Any.resolve(""), ProductFilter::Any);
    }

    #[test]
    fn test_tenant_id_roundtrips_through_serde() {
        let tenant = TenantId::generate();
        let json = serde_json::to_string(&tenant).unwrap();
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tenant);
        assert!(serde_json::from_str::<TenantId>("\"nope\"").is_err());
    }
}
