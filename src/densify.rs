//! Densification
//!
//! Left-joins a sparse series onto the full calendar of a scope: every day
//! from `from` to `to` appears exactly once, ascending, with zeros where the
//! sparse series has no entry.

use crate::error::SeriesError;
use crate::models::DailyMetric;
use crate::scope::ScopeFilter;
use crate::source::{DayAggregate, MetricKind, SparseSeries};
use chrono_tz::Tz;

/// Calendar generator bound to the zone events were truncated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Densifier {
    timezone: Tz,
}

impl Densifier {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Produce the complete daily series for `scope`
    pub fn densify(&self, scope: &ScopeFilter, series: &SparseSeries) -> Result<Vec<DailyMetric>, SeriesError> {
        if series.timezone != self.timezone {
            return Err(SeriesError::Config(format!(
                "series truncated in {} cannot be densified on a {} calendar",
                series.timezone, self.timezone
            )));
        }

        let metrics = scope
            .calendar()
            .days()
            .map(|day| {
                let aggregate = series.get(day).copied().unwrap_or_default();
                DailyMetric {
                    day,
                    value: aggregate.value,
                    average: average_of(series.kind, aggregate),
                }
            })
            .collect();
        Ok(metrics)
    }
}

fn average_of(kind: MetricKind, aggregate: DayAggregate) -> Option<f64> {
    if !kind.has_average() {
        return None;
    }
    if aggregate.events == 0 {
        return Some(0.0);
    }
    Some(aggregate.value as f64 / aggregate.events as f64)
}
