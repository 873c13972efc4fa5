//! Selection history ring buffer and loop detector

use core::time::Duration;
use std::collections::VecDeque;

use tokio::time::Instant;

use crate::types::DestinationId;

/// One applied selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRecord {
    pub destination_id: DestinationId,
    pub at: Instant,
}

/// Bounded record of recent selections, used only to detect selection loops
///
/// Timestamps come from the monotonic clock, so suspend cycles and wall-clock
/// adjustments cannot skew the trailing-window count.
#[derive(Debug, Clone)]
pub struct SelectionHistory {
    entries: VecDeque<SelectionRecord>,
    capacity: usize,
}

impl SelectionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a selection, evicting the oldest entry when full
    pub fn record(&mut self, destination_id: DestinationId, at: Instant) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(SelectionRecord { destination_id, at });
    }

    /// Number of selections no older than `window` relative to `now`
    pub fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.entries
            .iter()
            .filter(|record| now.saturating_duration_since(record.at) <= window)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&SelectionRecord> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SelectionRecord> {
        self.entries.iter()
    }
}

/// Backoff for a window holding `count` selections once `count >= threshold`
///
/// `min(2^(count - threshold) * base, max)`.
pub fn loop_backoff(count: usize, threshold: usize, base: Duration, max: Duration) -> Duration {
    let exponent = count.saturating_sub(threshold) as u32;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let millis = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> DestinationId {
        DestinationId::new([n; 16])
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let start = Instant::now();
        let mut history = SelectionHistory::new(3);
        for n in 0..5u8 {
            history.record(id(n), start + Duration::from_secs(n as u64));
        }
        assert_eq!(history.len(), 3);
        let ids: Vec<_> = history.iter().map(|r| r.destination_id).collect();
        assert_eq!(ids, vec![id(2), id(3), id(4)]);
    }

    #[test]
    fn test_count_within_trailing_window() {
        let start = Instant::now();
        let mut history = SelectionHistory::new(10);
        history.record(id(1), start);
        history.record(id(2), start + Duration::from_secs(30));
        history.record(id(3), start + Duration::from_secs(70));

        let now = start + Duration::from_secs(70);
        assert_eq!(history.count_within(now, Duration::from_secs(60)), 2);
        assert_eq!(history.count_within(now, Duration::from_secs(70)), 3);
    }

    #[test]
    fn test_loop_backoff_doubles_and_caps() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(600_000);
        assert_eq!(loop_backoff(3, 3, base, max), Duration::from_millis(1_000));
        assert_eq!(loop_backoff(4, 3, base, max), Duration::from_millis(2_000));
        assert_eq!(loop_backoff(5, 3, base, max), Duration::from_millis(4_000));
        assert_eq!(loop_backoff(13, 3, base, max), Duration::from_millis(600_000));
        assert_eq!(loop_backoff(200, 3, base, max), max);
    }
}
