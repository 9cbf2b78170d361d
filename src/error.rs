//! Series Error Types
//!
//! Centralized error handling for scope construction, storage access and
//! series computation. Every variant is terminal for the request that raised
//! it; nothing in this crate retries.

use crate::source::MetricKind;
use chrono::NaiveDate;

/// Errors raised by the series engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeriesError {
    #[error("Invalid date range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },

    #[error("Invalid tenant id: {0:?}")]
    InvalidTenant(String),

    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Raw and view paths diverge for {kind}: {detail}")]
    PathDivergence { kind: MetricKind, detail: String },

    #[error("Aggregate out of range: {0}")]
    ValueOverflow(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SeriesError {
    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            SeriesError::InvalidRange { .. } => "invalid_range",
            SeriesError::InvalidTenant(_) => "invalid_tenant",
            SeriesError::StoreUnavailable(_) => "store_unavailable",
            SeriesError::PathDivergence { .. } => "path_divergence",
            SeriesError::ValueOverflow(_) => "value_overflow",
            SeriesError::Validation(_) => "validation_error",
            SeriesError::Config(_) => "configuration_error",
        }
    }

    /// Whether the caller supplied bad input, as opposed to an engine or storage fault
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SeriesError::InvalidRange { .. }
                | SeriesError::InvalidTenant(_)
                | SeriesError::Validation(_)
        )
    }
}

impl From<sqlx::Error> for SeriesError {
    fn from(err: sqlx::Error) -> Self {
        // SQLite aborts an integer SUM that leaves the i64 range with this message.
        if let sqlx::Error::Database(db) = &err {
            if db.message().contains("integer overflow") {
                tracing::warn!("Aggregate overflowed in the store: {}", db.message());
                return SeriesError::ValueOverflow(db.message().to_string());
            }
        }
        tracing::error!("Database error: {:?}", err);
        SeriesError::StoreUnavailable(err.to_string())
    }
}

impl From<validator::ValidationErrors> for SeriesError {
    fn from(err: validator::ValidationErrors) -> Self {
        tracing::debug!("Input validation failed: {:?}", err);
        SeriesError::Validation(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SeriesError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        tracing::warn!("Event store call timed out");
        SeriesError::StoreUnavailable("store call timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let errors = [
            SeriesError::InvalidRange { from: day, to: day },
            SeriesError::InvalidTenant(String::new()),
            SeriesError::StoreUnavailable("down".into()),
            SeriesError::PathDivergence {
                kind: MetricKind::VisitCount,
                detail: "x".into(),
            },
            SeriesError::ValueOverflow("sum".into()),
            SeriesError::Validation("bad".into()),
            SeriesError::Config("bad".into()),
        ];

        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_caller_errors() {
        assert!(SeriesError::InvalidTenant("".into()).is_caller_error());
        assert!(!SeriesError::StoreUnavailable("timeout".into()).is_caller_error());
        assert!(!SeriesError::ValueOverflow("sum".into()).is_caller_error());
    }

    #[test]
    fn test_sqlx_error_maps_to_store_unavailable() {
        let err: SeriesError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.code(), "store_unavailable");
    }
}
