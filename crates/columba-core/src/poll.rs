//! Adaptive Poll Controller
//!
//! Decides how long to wait before the next engine poll. While a consumer is
//! active (an open conversation) every poll uses the minimum interval; once idle
//! the interval grows geometrically up to the maximum.
//!
//! Interval and active flag live in one guarded cell so every compound
//! read-compute-write is indivisible under concurrent callers.

use core::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::PollConfig;

/// Snapshot of the controller state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollState {
    pub current_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub is_active: bool,
}

impl PollState {
    fn initial(config: &PollConfig) -> Self {
        Self {
            current_interval_ms: config.min_interval_ms,
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms,
            backoff_multiplier: config.backoff_multiplier,
            is_active: false,
        }
    }

    fn grown(&self) -> u64 {
        let next = (self.current_interval_ms as f64 * self.backoff_multiplier).ceil();
        if next >= self.max_interval_ms as f64 {
            self.max_interval_ms
        } else {
            (next as u64).max(self.min_interval_ms)
        }
    }
}

/// Thread-safe adaptive poll interval controller
#[derive(Debug)]
pub struct AdaptivePollController {
    state: Mutex<PollState>,
}

impl AdaptivePollController {
    /// Create a controller in the idle initial state
    ///
    /// The configuration is expected to be validated already.
    pub fn new(config: &PollConfig) -> Self {
        Self {
            state: Mutex::new(PollState::initial(config)),
        }
    }

    /// A consumer is watching: poll at the minimum interval from now on
    pub fn mark_active(&self) {
        let mut state = self.state.lock();
        state.is_active = true;
        state.current_interval_ms = state.min_interval_ms;
    }

    /// Nobody is watching: subsequent polls back off
    pub fn mark_idle(&self) {
        self.state.lock().is_active = false;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active
    }

    /// Compute, store and return the delay before the next poll
    pub fn next_interval(&self) -> Duration {
        let mut state = self.state.lock();
        if state.is_active {
            state.current_interval_ms = state.min_interval_ms;
        } else {
            state.current_interval_ms = state.grown();
        }
        trace!(
            "Next poll in {}ms (active: {})",
            state.current_interval_ms,
            state.is_active
        );
        Duration::from_millis(state.current_interval_ms)
    }

    /// Current interval without advancing the backoff sequence
    pub fn current_interval(&self) -> Duration {
        let state = self.state.lock();
        if state.is_active {
            Duration::from_millis(state.min_interval_ms)
        } else {
            Duration::from_millis(state.current_interval_ms)
        }
    }

    /// Back to the idle initial state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current_interval_ms = state.min_interval_ms;
        state.is_active = false;
    }

    pub fn snapshot(&self) -> PollState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn controller() -> AdaptivePollController {
        AdaptivePollController::new(&PollConfig::default())
    }

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn test_idle_backoff_sequence() {
        let poll = controller();
        let sequence: Vec<u64> = (0..6).map(|_| ms(poll.next_interval())).collect();
        assert_eq!(sequence, vec![4_000, 8_000, 16_000, 30_000, 30_000, 30_000]);
    }

    #[test]
    fn test_current_interval_does_not_advance() {
        let poll = controller();
        poll.next_interval();
        assert_eq!(ms(poll.current_interval()), 4_000);
        assert_eq!(ms(poll.current_interval()), 4_000);
        assert_eq!(ms(poll.next_interval()), 8_000);
    }

    #[test]
    fn test_mark_active_resets_inflight_backoff() {
        let poll = controller();
        for _ in 0..4 {
            poll.next_interval();
        }
        poll.mark_active();
        assert_eq!(ms(poll.current_interval()), 2_000);
        assert_eq!(ms(poll.next_interval()), 2_000);
        assert_eq!(ms(poll.next_interval()), 2_000);
    }

    #[test]
    fn test_idle_after_active_resumes_backoff_from_min() {
        let poll = controller();
        poll.mark_active();
        poll.next_interval();
        poll.mark_idle();
        assert_eq!(ms(poll.next_interval()), 4_000);
    }

    #[test]
    fn test_reset_is_idle_initial_state() {
        let poll = controller();
        poll.mark_active();
        poll.reset();
        let snapshot = poll.snapshot();
        assert_eq!(snapshot.current_interval_ms, 2_000);
        assert!(!snapshot.is_active);
    }

    #[test]
    fn test_unit_multiplier_stays_at_min() {
        let poll = AdaptivePollController::new(&PollConfig {
            backoff_multiplier: 1.0,
            ..PollConfig::default()
        });
        assert_eq!(ms(poll.next_interval()), 2_000);
        assert_eq!(ms(poll.next_interval()), 2_000);
    }

    #[test]
    fn test_concurrent_active_then_next_returns_min() {
        let poll = Arc::new(controller());
        let violations = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let poll = poll.clone();
                let violations = violations.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        poll.mark_active();
                        if ms(poll.next_interval()) != 2_000 {
                            violations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(violations.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_reset_never_leaves_range() {
        let poll = Arc::new(controller());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let poll = poll.clone();
                std::thread::spawn(move || {
                    for n in 0..500 {
                        match (i + n) % 3 {
                            0 => poll.reset(),
                            1 => {
                                let interval = ms(poll.next_interval());
                                assert!((2_000..=30_000).contains(&interval));
                            }
                            _ => {
                                let interval = ms(poll.current_interval());
                                assert!((2_000..=30_000).contains(&interval));
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        poll.reset();
        assert_eq!(ms(poll.current_interval()), 2_000);
        assert!(!poll.is_active());
    }
}
