//! Synchronous relay selection state machine
//!
//! The `IDLE` guard in [`RelaySelector::evaluate_batch`] is what breaks the
//! feedback loop between applying a selection (a store write) and the store
//! re-emitting the candidate list because of that write. The loop detector is
//! an independent circuit breaker on top of it.
//!
//! Every user action bumps the selector epoch. Tickets and timers carry the
//! epoch they were issued under and become no-ops once it moves on.

use core::time::Duration;
use std::collections::HashSet;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{best_candidate, best_candidate_excluding, loop_backoff, SelectionHistory, SelectionState};
use crate::config::RelaySelectionConfig;
use crate::types::{DestinationId, RelayCandidate};

/// Permission to apply one automatic selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTicket {
    pub epoch: u64,
    pub candidate: RelayCandidate,
}

/// What to do with a debounced candidate batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    /// Not `IDLE`; the batch only refreshed the candidate snapshot
    Discarded { state: SelectionState },
    AutoSelectDisabled,
    Empty,
    /// The current relay is already the best candidate
    AlreadySelected,
    Select(SelectionTicket),
}

/// Result of completing an applied selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Return to `IDLE` after `cooldown` unless the epoch changes first
    Stable { epoch: u64, cooldown: Duration },
    /// Loop detected; return to `IDLE` after `delay` unless the epoch changes first
    BackingOff {
        epoch: u64,
        delay: Duration,
        selections_in_window: usize,
    },
    /// A user action overtook this selection; nothing to schedule
    Superseded,
}

/// Relay selection state, owned by a single logical owner
#[derive(Debug)]
pub struct RelaySelector {
    config: RelaySelectionConfig,
    state: SelectionState,
    epoch: u64,
    auto_select: bool,
    current: Option<DestinationId>,
    latest: Vec<RelayCandidate>,
    history: SelectionHistory,
    applied: u64,
    current_backoff: Option<Duration>,
}

impl RelaySelector {
    pub fn new(config: RelaySelectionConfig) -> Self {
        Self {
            history: SelectionHistory::new(config.history_capacity),
            config,
            state: SelectionState::Idle,
            epoch: 0,
            auto_select: true,
            current: None,
            latest: Vec::new(),
            applied: 0,
            current_backoff: None,
        }
    }

    pub fn config(&self) -> &RelaySelectionConfig {
        &self.config
    }

    /// Swap timing configuration, keeping state, epoch and the newest history
    pub fn reconfigure(&mut self, config: RelaySelectionConfig) {
        if config.history_capacity != self.config.history_capacity {
            let mut history = SelectionHistory::new(config.history_capacity);
            for record in self.history.iter() {
                history.record(record.destination_id, record.at);
            }
            self.history = history;
        }
        self.config = config;
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn auto_select(&self) -> bool {
        self.auto_select
    }

    pub fn set_auto_select(&mut self, enabled: bool) {
        if self.auto_select != enabled {
            info!("Relay auto-select {}", if enabled { "enabled" } else { "disabled" });
        }
        self.auto_select = enabled;
    }

    /// Relay most recently applied, automatically or manually
    pub fn current_relay(&self) -> Option<DestinationId> {
        self.current
    }

    pub fn set_current_relay(&mut self, relay: Option<DestinationId>) {
        self.current = relay;
    }

    /// Number of automatic selections applied so far
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    /// Delay of the active loop backoff, if any
    pub fn current_backoff(&self) -> Option<Duration> {
        self.current_backoff
    }

    pub fn history(&self) -> &SelectionHistory {
        &self.history
    }

    pub fn latest_candidates(&self) -> &[RelayCandidate] {
        &self.latest
    }

    /// Evaluate one debounced batch
    ///
    /// Always refreshes the candidate snapshot; only `IDLE` may start a selection.
    pub fn evaluate_batch(&mut self, batch: Vec<RelayCandidate>) -> BatchDecision {
        self.latest = batch;

        if self.state != SelectionState::Idle {
            debug!(
                "Discarding candidate batch of {} while {}",
                self.latest.len(),
                self.state
            );
            return BatchDecision::Discarded { state: self.state };
        }
        if !self.auto_select {
            return BatchDecision::AutoSelectDisabled;
        }
        let Some(best) = best_candidate(&self.latest).cloned() else {
            return BatchDecision::Empty;
        };
        if self.current == Some(best.destination_id) {
            return BatchDecision::AlreadySelected;
        }

        self.state = SelectionState::Selecting;
        debug!(
            "Selecting relay {} ({} hops)",
            best.destination_id.short(),
            best.hop_count
        );
        BatchDecision::Select(SelectionTicket {
            epoch: self.epoch,
            candidate: best,
        })
    }

    /// Whether `ticket` may still perform its write
    pub fn is_ticket_current(&self, ticket: &SelectionTicket) -> bool {
        ticket.epoch == self.epoch && self.state == SelectionState::Selecting
    }

    /// Record a completed apply and move to `STABLE` or `BACKING_OFF`
    pub fn complete(&mut self, ticket: &SelectionTicket, now: Instant) -> ApplyOutcome {
        if !self.is_ticket_current(ticket) {
            debug!(
                "Selection of {} superseded by a user action",
                ticket.candidate.destination_id.short()
            );
            return ApplyOutcome::Superseded;
        }

        self.applied += 1;
        self.current = Some(ticket.candidate.destination_id);
        self.history.record(ticket.candidate.destination_id, now);

        let in_window = self.history.count_within(now, self.config.loop_window());
        if in_window >= self.config.loop_threshold {
            let delay = loop_backoff(
                in_window,
                self.config.loop_threshold,
                Duration::from_millis(self.config.base_backoff_ms),
                Duration::from_millis(self.config.max_backoff_ms),
            );
            warn!(
                "Relay selection loop detected: {} selections in {}ms, backing off {}ms",
                in_window,
                self.config.loop_window_ms,
                delay.as_millis()
            );
            self.state = SelectionState::BackingOff;
            self.current_backoff = Some(delay);
            return ApplyOutcome::BackingOff {
                epoch: self.epoch,
                delay,
                selections_in_window: in_window,
            };
        }

        self.state = SelectionState::Stable;
        self.current_backoff = None;
        ApplyOutcome::Stable {
            epoch: self.epoch,
            cooldown: self.config.cooldown(),
        }
    }

    /// An apply failed or timed out; go straight back to `IDLE`
    pub fn fail(&mut self, ticket: &SelectionTicket) {
        if self.is_ticket_current(ticket) {
            self.state = SelectionState::Idle;
        }
    }

    /// Cooldown/backoff timer fired; returns whether it moved the state to `IDLE`
    pub fn timer_elapsed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        match self.state {
            SelectionState::Stable | SelectionState::BackingOff => {
                debug!("Relay selection {} -> IDLE", self.state);
                self.state = SelectionState::Idle;
                self.current_backoff = None;
                true
            }
            _ => false,
        }
    }

    /// User action: force `IDLE`, invalidate tickets and timers, stop auto-select
    ///
    /// Returns the new epoch.
    pub fn force_idle_for_user(&mut self) -> u64 {
        self.epoch += 1;
        self.state = SelectionState::Idle;
        self.current_backoff = None;
        self.auto_select = false;
        self.epoch
    }

    /// Best known candidate not in `excluding`
    pub fn alternative(&self, excluding: &HashSet<DestinationId>) -> Option<RelayCandidate> {
        best_candidate_excluding(&self.latest, excluding).cloned()
    }
}
