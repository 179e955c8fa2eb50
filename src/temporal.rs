//! # Temporal Module
//!
//! Timestamps, calendar days and reconciliation windows.
//! All times are UTC `OffsetDateTime` values; days are `time::Date`.

use crate::error::{Result, SmartfireError};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Duration, OffsetDateTime};

/// A closed time window `[start, end]`
///
/// Unlike half-open intervals, two windows that share only an endpoint overlap.
/// Fire and event spans are compared this way so that a fire ending at midnight
/// still associates with an event starting at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Start time (inclusive)
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    /// End time (inclusive)
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Window {
    /// Create a new window
    ///
    /// # Errors
    /// Returns an error if `start` is after `end`
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        if start > end {
            return Err(SmartfireError::invalid(format!(
                "Invalid window: start ({}) is after end ({})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Window covering whole UTC days from `first` through `last`
    pub fn from_dates(first: Date, last: Date) -> Result<Self> {
        let start = first.midnight().assume_utc();
        let end = last.midnight().assume_utc() + Duration::days(1) - Duration::SECOND;
        Self::new(start, end)
    }

    /// Widen the window by whole days in each direction
    ///
    /// # Errors
    /// `InvalidArgument` when the widened bounds leave the representable
    /// date range or cross each other
    pub fn widen(&self, backward_days: i64, forward_days: i64) -> Result<Self> {
        let out_of_range = |days: i64| {
            SmartfireError::invalid(format!(
                "Date uncertainty of {} days moves window {} out of range",
                days, self
            ))
        };
        let start = days(backward_days)
            .and_then(|span| self.start.checked_sub(span))
            .ok_or_else(|| out_of_range(backward_days))?;
        let end = days(forward_days)
            .and_then(|span| self.end.checked_add(span))
            .ok_or_else(|| out_of_range(forward_days))?;
        Self::new(start, end)
    }

    /// Check if the two windows share at least one instant
    pub fn overlaps(&self, other: &Window) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Check if `other` lies entirely inside this window
    pub fn contains(&self, other: &Window) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Human-readable description used in job names
    pub fn describe(&self) -> String {
        let first = self.start.date();
        let last = self.end.date();
        if first == last {
            format!("for {}", first)
        } else {
            format!("between {} and {}", first, last)
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

fn days(count: i64) -> Option<Duration> {
    count.checked_mul(86_400).map(Duration::seconds)
}

/// Check if two closed spans overlap
#[inline]
pub fn overlaps(
    start_a: OffsetDateTime,
    end_a: OffsetDateTime,
    start_b: OffsetDateTime,
    end_b: OffsetDateTime,
) -> bool {
    start_a <= end_b && end_a >= start_b
}

/// Current UTC time
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Format an elapsed duration as `1h 2m 3s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.whole_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
