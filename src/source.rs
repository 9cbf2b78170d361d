//! Daily Series Sources
//!
//! The raw aggregator and the view aggregator are two interchangeable
//! implementations of [`DailySeriesSource`]. Both return a sparse series:
//! days without a matching event are absent, never zero.

use crate::error::SeriesError;
use crate::scope::ScopeFilter;
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which per-day value a series carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    VisitCount,
    OrderCount,
    OrderQuantity,
    OrderAmount,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::VisitCount,
        MetricKind::OrderCount,
        MetricKind::OrderQuantity,
        MetricKind::OrderAmount,
    ];

    /// Whether the series carries a per-order average next to its value
    pub fn has_average(&self) -> bool {
        matches!(self, MetricKind::OrderQuantity | MetricKind::OrderAmount)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::VisitCount => "visit_count",
            MetricKind::OrderCount => "order_count",
            MetricKind::OrderQuantity => "order_quantity",
            MetricKind::OrderAmount => "order_amount",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Computation path selected by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesPath {
    /// Group matching event rows on every call
    #[default]
    Raw,
    /// Read the live grouping views
    View,
}

impl SeriesPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesPath::Raw => "raw",
            SeriesPath::View => "view",
        }
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate of one day before densification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DayAggregate {
    /// Count, quantity or amount in minor units, per the series kind
    pub value: i64,
    /// Number of events (visits or orders) that contributed to `value`
    pub events: i64,
}

impl DayAggregate {
    pub fn new(value: i64, events: i64) -> Self {
        Self { value, events }
    }

    /// Merge another partial aggregate of the same day; `None` when either sum leaves the i64 range
    pub fn checked_absorb(&self, other: DayAggregate) -> Option<DayAggregate> {
        Some(DayAggregate {
            value: self.value.checked_add(other.value)?,
            events: self.events.checked_add(other.events)?,
        })
    }
}

/// Sparse per-day result; only days with at least one matching event appear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseSeries {
    pub kind: MetricKind,
    /// Zone the event timestamps were truncated in
    pub timezone: Tz,
    pub days: BTreeMap<NaiveDate, DayAggregate>,
}

impl SparseSeries {
    pub fn new(kind: MetricKind, timezone: Tz) -> Self {
        Self {
            kind,
            timezone,
            days: BTreeMap::new(),
        }
    }

    /// Add a partial aggregate, merging with any existing entry for the day
    pub fn add(&mut self, day: NaiveDate, aggregate: DayAggregate) -> Result<(), SeriesError> {
        let kind = self.kind;
        let entry = self.days.entry(day).or_default();
        *entry = entry
            .checked_absorb(aggregate)
            .ok_or_else(|| SeriesError::ValueOverflow(format!("{} on {}", kind, day)))?;
        Ok(())
    }

    pub fn get(&self, day: NaiveDate) -> Option<&DayAggregate> {
        self.days.get(&day)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Sum of all values in the series; `None` on overflow
    pub fn total(&self) -> Option<i64> {
        self.days.values().try_fold(0i64, |acc, d| acc.checked_add(d.value))
    }

    /// First day on which `other` disagrees with `self`
    pub fn first_difference(&self, other: &SparseSeries) -> Option<NaiveDate> {
        self.days
            .keys()
            .chain(other.days.keys())
            .filter(|day| self.days.get(day) != other.days.get(day))
            .min()
            .copied()
    }
}

/// Capability shared by both computation paths
#[async_trait]
pub trait DailySeriesSource: Send + Sync {
    /// Path this source implements
    fn path(&self) -> SeriesPath;

    /// Group the events matching `scope` by calendar day
    async fn compute_daily(
        &self,
        scope: &ScopeFilter,
        kind: MetricKind,
    ) -> Result<SparseSeries, SeriesError>;
}
