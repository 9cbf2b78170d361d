//! Calendar Days
//!
//! Day truncation and calendar sequence generation share one explicit time
//! zone. Events are bucketed with [`local_day`] and the densified calendar is
//! produced by [`CalendarRange`]; both must be fed the same zone or days
//! misalign silently.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Calendar day an instant falls on in `tz`
pub fn local_day(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// First instant of `day` in `tz`, expressed in UTC
///
/// Zones that skip local midnight on a transition day start that day at the
/// first local time that exists.
pub fn day_start_utc(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = day.and_time(chrono::NaiveTime::MIN);

    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => first_existing_after(midnight, tz),
    }
}

fn first_existing_after(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    // Transition gaps are at most a few hours; probe minute by minute.
    let mut probe = local;
    for _ in 0..(24 * 60) {
        probe += Duration::minutes(1);
        if let Some(t) = tz.from_local_datetime(&probe).earliest() {
            return t.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&local)
}

/// Half-open UTC interval covering the local days `[from, to]`
pub fn utc_bounds(from: NaiveDate, to: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day_start_utc(from, tz);
    let end = match to.succ_opt() {
        Some(next) => day_start_utc(next, tz),
        None => DateTime::<Utc>::MAX_UTC,
    };
    (start, end)
}

/// Inclusive, ascending sequence of calendar days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl CalendarRange {
    /// Range over `[from, to]`; empty when `from > to`
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Number of days in the range
    pub fn len(&self) -> usize {
        if self.from > self.to {
            0
        } else {
            ((self.to - self.from).num_days() + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn days(&self) -> CalendarDays {
        CalendarDays {
            next: (self.from <= self.to).then_some(self.from),
            last: self.to,
        }
    }
}

impl IntoIterator for CalendarRange {
    type Item = NaiveDate;
    type IntoIter = CalendarDays;

    fn into_iter(self) -> Self::IntoIter {
        self.days()
    }
}

/// Iterator over the days of a [`CalendarRange`]
#[derive(Debug, Clone)]
pub struct CalendarDays {
    next: Option<NaiveDate>,
    last: NaiveDate,
}

impl Iterator for CalendarDays {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let day = self.next?;
        self.next = if day < self.last { day.succ_opt() } else { None };
        Some(day)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match self.next {
            Some(day) => ((self.last - day).num_days() + 1) as usize,
            None => 0,
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for CalendarDays {}
