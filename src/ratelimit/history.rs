//! Per-key history of admitted request timestamps.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Admitted-request timestamps for one identity key, most recent first.
///
/// Timestamps are seconds in the caller's time base. Entries are kept sorted
/// even when concurrent callers record out of order, so the head is always
/// the maximum and expired entries always leave from the tail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryRecord {
    entries: VecDeque<f64>,
}

impl HistoryRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of admissions currently recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent admission.
    pub fn newest(&self) -> Option<f64> {
        self.entries.front().copied()
    }

    /// The oldest admission still recorded.
    pub fn oldest(&self) -> Option<f64> {
        self.entries.back().copied()
    }

    /// Iterate from most recent to oldest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().copied()
    }

    /// Record an admission at `now`, keeping the record sorted.
    pub fn record(&mut self, now: f64) {
        let at = self.entries.partition_point(|&t| t > now);
        self.entries.insert(at, now);
    }

    /// Drop entries that no longer count toward the quota at `now`.
    ///
    /// An entry is expired once it is `window` seconds old or older. When even
    /// the newest entry has expired the whole record is discarded at once;
    /// otherwise only the contiguous expired tail is popped.
    pub fn prune(&mut self, now: f64, window: f64) {
        let horizon = now - window;

        if self.newest().is_some_and(|newest| newest <= horizon) {
            self.entries.clear();
            return;
        }

        while let Some(oldest) = self.oldest() {
            if oldest > horizon {
                break;
            }
            self.entries.pop_back();
        }
    }

    /// Time until the oldest counted entry ages out and frees a slot.
    ///
    /// Clock skew can make the raw value negative (or NaN); it is clamped to zero.
    pub fn wait_time(&self, now: f64, window: f64) -> Duration {
        match self.oldest() {
            Some(oldest) => clamp_secs(oldest + window - now),
            None => Duration::ZERO,
        }
    }
}

impl FromIterator<f64> for HistoryRecord {
    /// Collect timestamps given most recent first.
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn clamp_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
