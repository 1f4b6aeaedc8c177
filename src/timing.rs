//! Construction timing samples
//!
//! The pool forwards one [`TimingSample`] per prefetched item and never
//! aggregates them itself. [`CreationTimeTracker`] is an optional host-side
//! consumer for deciding whether spare frame time is enough to build an
//! item of a given category.

use crate::category::Category;

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// How long one successful factory call took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TimingSample {
    pub category: Category,
    pub duration: Duration,
}

impl TimingSample {
    pub fn new(category: Category, duration: Duration) -> Self {
        Self { category, duration }
    }

    pub fn as_nanos(&self) -> u128 {
        self.duration.as_nanos()
    }
}

/// Per-category running average of construction time.
///
/// Each sample moves the estimate a quarter of the way toward itself, so a
/// single outlier does not dominate.
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{Category, CreationTimeTracker, TimingSample};
/// use std::time::{Duration, Instant};
///
/// let tracker = CreationTimeTracker::new();
/// let row = Category::new(1);
/// tracker.record(TimingSample::new(row, Duration::from_millis(4)));
///
/// let now = Instant::now();
/// assert!(tracker.will_create_in_time(row, now, now + Duration::from_millis(8)));
/// assert!(!tracker.will_create_in_time(row, now, now + Duration::from_millis(2)));
/// ```
#[derive(Debug, Default)]
pub struct CreationTimeTracker {
    averages: DashMap<Category, Duration>,
}

impl CreationTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sample into its category's running average
    pub fn record(&self, sample: TimingSample) {
        let mut average = self.averages.entry(sample.category).or_insert(Duration::ZERO);
        *average = running_average(*average, sample.duration);
    }

    /// Current estimate, or `None` if the category has no samples yet
    pub fn average(&self, category: Category) -> Option<Duration> {
        self.averages.get(&category).map(|average| *average)
    }

    /// Whether building one item of `category` starting at `now` should
    /// finish before `deadline`.
    ///
    /// Categories without samples are assumed to fit.
    pub fn will_create_in_time(&self, category: Category, now: Instant, deadline: Instant) -> bool {
        match self.average(category) {
            None => true,
            Some(expected) if expected.is_zero() => true,
            Some(expected) => now + expected < deadline,
        }
    }
}

fn running_average(old: Duration, new: Duration) -> Duration {
    if old.is_zero() {
        new
    } else {
        old / 4 * 3 + new / 4
    }
}
