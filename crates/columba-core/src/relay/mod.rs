//! Relay selection logic
//!
//! Pure, synchronous half of the relay selection state machine: phases,
//! candidate ranking, the selection history and the loop detector. The async
//! manager in `columba-runtime` owns an instance behind a lock and drives it
//! from the debounced candidate stream, its timers and user actions.

mod history;
mod selector;

pub use history::{loop_backoff, SelectionHistory, SelectionRecord};
pub use selector::{ApplyOutcome, BatchDecision, RelaySelector, SelectionTicket};

use core::cmp::Ordering;
use core::fmt;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{DestinationId, RelayCandidate};

/// Phase of the automatic relay selection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionState {
    /// Ready to evaluate the next candidate batch
    Idle,
    /// An automatic selection is being applied
    Selecting,
    /// A selection was applied; cooling down
    Stable,
    /// The loop detector tripped; ignoring automatic triggers
    BackingOff,
}

impl Default for SelectionState {
    fn default() -> Self {
        SelectionState::Idle
    }
}

impl fmt::Display for SelectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionState::Idle => write!(f, "IDLE"),
            SelectionState::Selecting => write!(f, "SELECTING"),
            SelectionState::Stable => write!(f, "STABLE"),
            SelectionState::BackingOff => write!(f, "BACKING_OFF"),
        }
    }
}

/// Preference order: fewer hops first, then the most recently seen
fn preference(a: &RelayCandidate, b: &RelayCandidate) -> Ordering {
    a.hop_count
        .cmp(&b.hop_count)
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.destination_id.cmp(&b.destination_id))
}

/// Best candidate of a batch
pub fn best_candidate(candidates: &[RelayCandidate]) -> Option<&RelayCandidate> {
    candidates.iter().min_by(|a, b| preference(a, b))
}

/// Best candidate whose destination is not in `excluding`
pub fn best_candidate_excluding<'a>(
    candidates: &'a [RelayCandidate],
    excluding: &HashSet<DestinationId>,
) -> Option<&'a RelayCandidate> {
    candidates
        .iter()
        .filter(|candidate| !excluding.contains(&candidate.destination_id))
        .min_by(|a, b| preference(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn candidate(n: u8, hops: u8, seen: u64) -> RelayCandidate {
        RelayCandidate {
            destination_id: DestinationId::new([n; 16]),
            display_name: format!("relay-{}", n),
            hop_count: hops,
            public_key: vec![n; 32],
            last_seen: Timestamp::new(seen),
        }
    }

    #[test]
    fn test_fewest_hops_wins() {
        let batch = vec![candidate(1, 4, 100), candidate(2, 1, 50), candidate(3, 2, 200)];
        assert_eq!(best_candidate(&batch).unwrap().destination_id, DestinationId::new([2; 16]));
    }

    #[test]
    fn test_tie_broken_by_most_recently_seen() {
        let batch = vec![candidate(1, 2, 100), candidate(2, 2, 300), candidate(3, 2, 200)];
        assert_eq!(best_candidate(&batch).unwrap().destination_id, DestinationId::new([2; 16]));
    }

    #[test]
    fn test_excluding_skips_current_relay() {
        let batch = vec![candidate(1, 1, 100), candidate(2, 3, 100)];
        let excluding: HashSet<_> = [DestinationId::new([1; 16])].into_iter().collect();
        assert_eq!(
            best_candidate_excluding(&batch, &excluding).unwrap().destination_id,
            DestinationId::new([2; 16])
        );
        let everything: HashSet<_> = batch.iter().map(|c| c.destination_id).collect();
        assert!(best_candidate_excluding(&batch, &everything).is_none());
    }

    #[test]
    fn test_empty_batch_has_no_best() {
        assert!(best_candidate(&[]).is_none());
    }
}
