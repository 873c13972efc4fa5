//! Relay Manager
//!
//! Async driver of the [`RelaySelector`] state machine. It observes the relay
//! store's candidate list, debounces bursts, applies automatic selections and
//! runs the cooldown/backoff timers that return the machine to `IDLE`.
//!
//! Automatic applies and manual overrides write under one apply lock. An
//! automatic apply re-checks its ticket under that lock before each write, and a
//! manual override invalidates every outstanding ticket *before* queueing on the
//! lock, so the user's choice is always the last write.

use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc};

use columba_core::{
    relay::{ApplyOutcome, BatchDecision, SelectionTicket},
    with_engine, ColumbaError, ColumbaResult, DestinationId, EngineError, EngineLifecycle,
    RelayCandidate, RelaySelectionConfig, RelaySelector, RelayStore, SelectedRelay,
    SelectionState,
};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::events::{emit, AppEvent, AppEventSender};

struct RelayShared {
    selector: Mutex<RelaySelector>,
    store: Arc<dyn RelayStore>,
    lifecycle: Arc<EngineLifecycle>,
    app_events: AppEventSender,
    apply_lock: AsyncMutex<()>,
    timer: Mutex<Option<CancellationToken>>,
    state_tx: watch::Sender<SelectionState>,
}

/// Process-lifetime owner of relay selection; clones share one state machine
#[derive(Clone)]
pub struct RelayManager {
    shared: Arc<RelayShared>,
}

impl RelayManager {
    pub fn new(
        config: RelaySelectionConfig,
        store: Arc<dyn RelayStore>,
        lifecycle: Arc<EngineLifecycle>,
        app_events: AppEventSender,
    ) -> Self {
        let (state_tx, _) = watch::channel(SelectionState::Idle);
        Self {
            shared: Arc::new(RelayShared {
                selector: Mutex::new(RelaySelector::new(config)),
                store,
                lifecycle,
                app_events,
                apply_lock: AsyncMutex::new(()),
                timer: Mutex::new(None),
                state_tx,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn state(&self) -> SelectionState {
        self.shared.selector.lock().state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SelectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn applied_count(&self) -> u64 {
        self.shared.selector.lock().applied_count()
    }

    pub fn current_backoff(&self) -> Option<std::time::Duration> {
        self.shared.selector.lock().current_backoff()
    }

    pub fn auto_select(&self) -> bool {
        self.shared.selector.lock().auto_select()
    }

    pub fn current_relay(&self) -> Option<DestinationId> {
        self.shared.selector.lock().current_relay()
    }

    /// Best candidate from the latest batch that is not in `excluding`
    ///
    /// Used when the current relay turns out to be unreachable.
    pub fn alternative_relay(&self, excluding: &HashSet<DestinationId>) -> Option<RelayCandidate> {
        self.shared.selector.lock().alternative(excluding)
    }

    /// Apply new timing; takes effect for the next debounce window and timer
    pub fn reconfigure(&self, config: RelaySelectionConfig) {
        self.shared.selector.lock().reconfigure(config);
    }

    // ------------------------------------------------------------------
    // Session loop
    // ------------------------------------------------------------------

    /// Observe the store until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Relay manager starting");

        let mut candidates = self.shared.store.observe_candidates();
        let mut auto_select = self.shared.store.observe_auto_select();
        let mut auto_select_open = true;
        let mut pending: Option<Vec<RelayCandidate>> = None;

        let debounce = self.shared.selector.lock().config().debounce();
        let quiet = sleep(debounce);
        tokio::pin!(quiet);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = candidates.next() => match batch {
                    Some(batch) => {
                        pending = Some(batch);
                        quiet.as_mut().reset(Instant::now() + debounce);
                    }
                    None => {
                        debug!("Candidate stream ended, stopping relay manager");
                        break;
                    }
                },
                enabled = auto_select.next(), if auto_select_open => match enabled {
                    Some(enabled) => self.shared.selector.lock().set_auto_select(enabled),
                    None => auto_select_open = false,
                },
                _ = &mut quiet, if pending.is_some() => {
                    if let Some(batch) = pending.take() {
                        self.evaluate(batch);
                    }
                }
            }
        }

        info!("Relay manager stopped");
    }

    fn evaluate(&self, batch: Vec<RelayCandidate>) {
        let decision = self.shared.selector.lock().evaluate_batch(batch);
        match decision {
            BatchDecision::Select(ticket) => {
                self.publish_state();
                let manager = self.clone();
                tokio::spawn(async move { manager.apply_automatic(ticket).await });
            }
            BatchDecision::Discarded { .. } => {}
            other => trace!("Candidate batch: {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Automatic selection
    // ------------------------------------------------------------------

    async fn apply_automatic(&self, ticket: SelectionTicket) {
        let limit = self.shared.selector.lock().config().apply_timeout();
        let relay = ticket.candidate.destination_id;

        let write = AssertUnwindSafe(self.write_selection(&ticket)).catch_unwind();
        match timeout(limit, write).await {
            Ok(Ok(Ok(true))) => {
                let outcome = self.shared.selector.lock().complete(&ticket, Instant::now());
                self.after_apply(&ticket, outcome);
            }
            Ok(Ok(Ok(false))) => debug!("Selection of {} superseded before write", relay.short()),
            Ok(Ok(Err(e))) => {
                warn!("Applying relay {} failed: {}", relay.short(), e);
                self.shared.selector.lock().fail(&ticket);
            }
            Ok(Err(_)) => {
                error!("Applying relay {} panicked", relay.short());
                self.shared.selector.lock().fail(&ticket);
            }
            Err(_) => {
                warn!(
                    "Applying relay {} timed out after {}ms",
                    relay.short(),
                    limit.as_millis()
                );
                self.shared.selector.lock().fail(&ticket);
            }
        }
        self.publish_state();
    }

    /// Engine then store, under the apply lock; `false` if superseded
    async fn write_selection(&self, ticket: &SelectionTicket) -> ColumbaResult<bool> {
        let _guard = self.shared.apply_lock.lock().await;
        if !self.is_ticket_current(ticket) {
            return Ok(false);
        }

        let relay = ticket.candidate.destination_id;
        with_engine(&self.shared.lifecycle, "set_outbound_relay", |engine| async move {
            engine.set_outbound_relay(Some(relay)).await
        })
        .await?;

        if !self.is_ticket_current(ticket) {
            return Ok(false);
        }
        self.shared
            .store
            .upsert_selected_relay(SelectedRelay {
                destination_id: relay,
                display_name: ticket.candidate.display_name.clone(),
                manual: false,
            })
            .await?;
        Ok(true)
    }

    fn is_ticket_current(&self, ticket: &SelectionTicket) -> bool {
        self.shared.selector.lock().is_ticket_current(ticket)
    }

    fn after_apply(&self, ticket: &SelectionTicket, outcome: ApplyOutcome) {
        let selected = SelectedRelay {
            destination_id: ticket.candidate.destination_id,
            display_name: ticket.candidate.display_name.clone(),
            manual: false,
        };

        match outcome {
            ApplyOutcome::Stable { epoch, cooldown } => {
                info!(
                    "Auto-selected relay {} ({})",
                    selected.display_name,
                    selected.destination_id.short()
                );
                emit(&self.shared.app_events, AppEvent::RelaySelected { relay: selected });
                self.schedule_return_to_idle(epoch, cooldown);
            }
            ApplyOutcome::BackingOff {
                epoch,
                delay,
                selections_in_window,
            } => {
                emit(&self.shared.app_events, AppEvent::RelaySelected { relay: selected });
                emit(
                    &self.shared.app_events,
                    AppEvent::RelayLoopDetected {
                        selections_in_window,
                        backoff_ms: delay.as_millis() as u64,
                    },
                );
                self.schedule_return_to_idle(epoch, delay);
            }
            ApplyOutcome::Superseded => {}
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn schedule_return_to_idle(&self, epoch: u64, delay: std::time::Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.shared.timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => trace!("Relay timer for epoch {} cancelled", epoch),
                _ = sleep(delay) => {
                    if manager.shared.selector.lock().timer_elapsed(epoch) {
                        manager.publish_state();
                    }
                }
            }
        });
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.shared.timer.lock().take() {
            timer.cancel();
        }
    }

    fn publish_state(&self) {
        let selector = self.shared.selector.lock();
        self.shared.state_tx.send_replace(selector.state());
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// Use `destination_id` as the relay and stop automatic selection
    ///
    /// Any in-flight automatic apply is superseded and any pending cooldown or
    /// backoff is cancelled; the state machine is `IDLE` when this returns.
    pub async fn set_manual_relay(
        &self,
        destination_id: DestinationId,
        display_name: impl Into<String>,
    ) -> ColumbaResult<()> {
        let epoch = {
            let mut selector = self.shared.selector.lock();
            let epoch = selector.force_idle_for_user();
            selector.set_current_relay(Some(destination_id));
            epoch
        };
        self.cancel_timer();
        self.publish_state();
        info!(
            "Manual relay {} selected (epoch {})",
            destination_id.short(),
            epoch
        );

        self.shared.store.set_auto_select(false).await?;

        let _guard = self.shared.apply_lock.lock().await;
        match with_engine(&self.shared.lifecycle, "set_outbound_relay", |engine| async move {
            engine.set_outbound_relay(Some(destination_id)).await
        })
        .await
        {
            Ok(()) => {}
            Err(ColumbaError::Engine(EngineError::Unavailable)) => {
                debug!("Engine not running; relay applies at next start");
            }
            Err(e) => return Err(e),
        }

        let relay = SelectedRelay {
            destination_id,
            display_name: display_name.into(),
            manual: true,
        };
        self.shared.store.upsert_selected_relay(relay.clone()).await?;
        emit(&self.shared.app_events, AppEvent::RelaySelected { relay });
        Ok(())
    }

    /// Hand relay choice back to automatic selection
    pub async fn enable_auto_select(&self) -> ColumbaResult<()> {
        {
            let mut selector = self.shared.selector.lock();
            selector.force_idle_for_user();
            selector.set_auto_select(true);
        }
        self.cancel_timer();
        self.publish_state();
        self.shared.store.set_auto_select(true).await
    }

    /// Push the persisted relay to a freshly started engine
    pub async fn restore_selected(&self) -> ColumbaResult<Option<SelectedRelay>> {
        let Some(relay) = self.shared.store.selected_relay().await? else {
            return Ok(None);
        };

        let _guard = self.shared.apply_lock.lock().await;
        self.shared
            .selector
            .lock()
            .set_current_relay(Some(relay.destination_id));
        let destination = relay.destination_id;
        with_engine(&self.shared.lifecycle, "set_outbound_relay", |engine| async move {
            engine.set_outbound_relay(Some(destination)).await
        })
        .await?;

        info!(
            "Restored relay {} ({})",
            relay.display_name,
            relay.destination_id.short()
        );
        Ok(Some(relay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_app_event_channel;
    use columba_core::{create_engine_event_channel, EngineConfig, EngineFactory};
    use columba_harness::{fixtures, InMemoryRelayStore, MockEngine, MockEngineFactory};
    use std::time::Duration;

    struct Fixture {
        manager: RelayManager,
        store: Arc<InMemoryRelayStore>,
        engine: Arc<MockEngine>,
    }

    async fn fixture(store: InMemoryRelayStore) -> Fixture {
        let lifecycle = Arc::new(EngineLifecycle::new());
        let factory = MockEngineFactory::new();
        let (tx, _rx) = create_engine_event_channel();
        lifecycle.install_engine(factory.start(&EngineConfig::default(), tx).await.unwrap());

        let store = Arc::new(store);
        let (app_tx, _app_rx) = create_app_event_channel(64);
        let manager = RelayManager::new(
            RelaySelectionConfig::testing(),
            store.clone(),
            lifecycle,
            app_tx,
        );
        Fixture {
            manager,
            store,
            engine: factory.latest().unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_selects_best_candidate_then_cools_down() {
        let f = fixture(InMemoryRelayStore::with_candidates([
            fixtures::candidate(1, 3),
            fixtures::candidate(2, 1),
        ]))
        .await;
        let cancel = CancellationToken::new();
        let manager = f.manager.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });

        sleep(Duration::from_millis(150)).await;
        assert_eq!(f.manager.state(), SelectionState::Stable);
        assert_eq!(f.manager.current_relay(), Some(fixtures::destination(2)));
        let excluding: HashSet<_> = [fixtures::destination(2)].into_iter().collect();
        assert_eq!(
            f.manager.alternative_relay(&excluding).map(|c| c.destination_id),
            Some(fixtures::destination(1))
        );
        assert_eq!(f.engine.relay_calls(), vec![Some(fixtures::destination(2))]);
        assert_eq!(
            f.store.current_selection().map(|r| r.destination_id),
            Some(fixtures::destination(2))
        );

        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(f.manager.state(), SelectionState::Idle);
        assert_eq!(f.manager.applied_count(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_apply_returns_to_idle() {
        let f = fixture(InMemoryRelayStore::with_candidates([fixtures::candidate(1, 1)])).await;
        f.store.fail_selected_writes(true);
        let cancel = CancellationToken::new();
        let manager = f.manager.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });

        sleep(Duration::from_millis(150)).await;
        assert_eq!(f.manager.state(), SelectionState::Idle);
        assert_eq!(f.manager.applied_count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_relay_disables_auto_select() {
        let f = fixture(InMemoryRelayStore::with_candidates([fixtures::candidate(1, 1)])).await;
        f.manager
            .set_manual_relay(fixtures::destination(9), "home node")
            .await
            .unwrap();

        assert_eq!(f.manager.state(), SelectionState::Idle);
        assert!(!f.manager.auto_select());
        assert!(!f.store.auto_select_enabled());
        let selected = f.store.current_selection().unwrap();
        assert_eq!(selected.destination_id, fixtures::destination(9));
        assert!(selected.manual);
        assert_eq!(f.engine.relay_calls(), vec![Some(fixtures::destination(9))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_override_cancels_cooldown() {
        let f = fixture(InMemoryRelayStore::with_candidates([fixtures::candidate(1, 1)])).await;
        let cancel = CancellationToken::new();
        let manager = f.manager.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { manager.run(cancel).await }
        });

        sleep(Duration::from_millis(150)).await;
        assert_eq!(f.manager.state(), SelectionState::Stable);

        f.manager
            .set_manual_relay(fixtures::destination(5), "relay-5")
            .await
            .unwrap();
        assert_eq!(f.manager.state(), SelectionState::Idle);

        // The cancelled cooldown must not fire later
        sleep(Duration::from_millis(3_000)).await;
        assert_eq!(f.manager.state(), SelectionState::Idle);
        assert_eq!(f.manager.applied_count(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_selected_pushes_relay_to_engine() {
        let f = fixture(InMemoryRelayStore::new()).await;
        assert!(f.manager.restore_selected().await.unwrap().is_none());

        f.store
            .upsert_selected_relay(SelectedRelay {
                destination_id: fixtures::destination(3),
                display_name: "relay-3".to_string(),
                manual: true,
            })
            .await
            .unwrap();
        let restored = f.manager.restore_selected().await.unwrap().unwrap();
        assert_eq!(restored.destination_id, fixtures::destination(3));
        assert_eq!(f.manager.current_relay(), Some(fixtures::destination(3)));
        assert_eq!(f.engine.relay_calls(), vec![Some(fixtures::destination(3))]);
    }
}
