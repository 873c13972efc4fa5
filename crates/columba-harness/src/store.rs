//! In-memory relay store
//!
//! Mirrors the behaviour of the app's reactive database: every write to any
//! relay-related row re-emits the full candidate list to every observer, even
//! when the candidates themselves did not change. Selected-relay writes can be
//! paused or made to fail so tests can hold an apply in flight.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use columba_core::{
    ColumbaError, ColumbaResult, DestinationId, RelayCandidate, RelayStore, SelectedRelay,
};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::trace;

type CandidateTable = Arc<Mutex<BTreeMap<DestinationId, RelayCandidate>>>;

pub struct InMemoryRelayStore {
    candidates: CandidateTable,
    selected: Mutex<Option<SelectedRelay>>,
    auto_select: Arc<Mutex<bool>>,
    candidate_watchers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
    auto_select_watchers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
    selected_writes: Mutex<Vec<SelectedRelay>>,
    writes_paused: watch::Sender<bool>,
    blocked_writes: AtomicUsize,
    fail_selected_writes: AtomicBool,
    emissions: AtomicUsize,
}

impl Default for InMemoryRelayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelayStore {
    pub fn new() -> Self {
        let (writes_paused, _) = watch::channel(false);
        Self {
            candidates: Arc::new(Mutex::new(BTreeMap::new())),
            selected: Mutex::new(None),
            auto_select: Arc::new(Mutex::new(true)),
            candidate_watchers: Mutex::new(Vec::new()),
            auto_select_watchers: Mutex::new(Vec::new()),
            selected_writes: Mutex::new(Vec::new()),
            writes_paused,
            blocked_writes: AtomicUsize::new(0),
            fail_selected_writes: AtomicBool::new(false),
            emissions: AtomicUsize::new(0),
        }
    }

    /// Store pre-populated with `candidates`
    pub fn with_candidates(candidates: impl IntoIterator<Item = RelayCandidate>) -> Self {
        let store = Self::new();
        {
            let mut table = store.candidates.lock();
            for candidate in candidates {
                table.insert(candidate.destination_id, candidate);
            }
        }
        store
    }

    /// Replace the candidate table and notify observers
    pub fn replace_candidates(&self, candidates: impl IntoIterator<Item = RelayCandidate>) {
        {
            let mut table = self.candidates.lock();
            table.clear();
            for candidate in candidates {
                table.insert(candidate.destination_id, candidate);
            }
        }
        self.notify_candidates();
    }

    /// Re-emit the candidate list without changing it
    pub fn touch(&self) {
        self.notify_candidates();
    }

    pub fn candidates(&self) -> Vec<RelayCandidate> {
        self.candidates.lock().values().cloned().collect()
    }

    pub fn current_selection(&self) -> Option<SelectedRelay> {
        self.selected.lock().clone()
    }

    pub fn auto_select_enabled(&self) -> bool {
        *self.auto_select.lock()
    }

    /// Every selected-relay write that completed, in order
    pub fn selected_writes(&self) -> Vec<SelectedRelay> {
        self.selected_writes.lock().clone()
    }

    /// Number of candidate-list emissions delivered to observers
    pub fn emissions(&self) -> usize {
        self.emissions.load(Ordering::SeqCst)
    }

    /// Hold every selected-relay write until [`Self::resume_selected_writes`]
    pub fn pause_selected_writes(&self) {
        self.writes_paused.send_replace(true);
    }

    pub fn resume_selected_writes(&self) {
        self.writes_paused.send_replace(false);
    }

    /// Selected-relay writes currently held by the pause gate
    pub fn blocked_writes(&self) -> usize {
        self.blocked_writes.load(Ordering::SeqCst)
    }

    pub fn fail_selected_writes(&self, fail: bool) {
        self.fail_selected_writes.store(fail, Ordering::SeqCst);
    }

    fn notify_candidates(&self) {
        let mut watchers = self.candidate_watchers.lock();
        watchers.retain(|watcher| watcher.send(()).is_ok());
        self.emissions.fetch_add(watchers.len(), Ordering::SeqCst);
    }

    fn notify_auto_select(&self) {
        self.auto_select_watchers
            .lock()
            .retain(|watcher| watcher.send(()).is_ok());
    }

    async fn wait_until_writable(&self) {
        let mut paused = self.writes_paused.subscribe();
        let mut blocked = false;
        loop {
            if !*paused.borrow_and_update() {
                break;
            }
            if !blocked {
                blocked = true;
                self.blocked_writes.fetch_add(1, Ordering::SeqCst);
            }
            if paused.changed().await.is_err() {
                break;
            }
        }
        if blocked {
            self.blocked_writes.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl RelayStore for InMemoryRelayStore {
    fn observe_candidates(&self) -> BoxStream<'static, Vec<RelayCandidate>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(());
        self.candidate_watchers.lock().push(tx);
        let table = self.candidates.clone();

        stream::unfold(rx, move |mut rx| {
            let table = table.clone();
            async move {
                rx.recv().await?;
                let snapshot: Vec<_> = table.lock().values().cloned().collect();
                Some((snapshot, rx))
            }
        })
        .boxed()
    }

    fn observe_auto_select(&self) -> BoxStream<'static, bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(());
        self.auto_select_watchers.lock().push(tx);
        let value = self.auto_select.clone();

        stream::unfold(rx, move |mut rx| {
            let value = value.clone();
            async move {
                rx.recv().await?;
                let enabled = *value.lock();
                Some((enabled, rx))
            }
        })
        .boxed()
    }

    async fn upsert_candidate(&self, candidate: RelayCandidate) -> ColumbaResult<()> {
        trace!("Upserting relay candidate {}", candidate.destination_id.short());
        self.candidates
            .lock()
            .insert(candidate.destination_id, candidate);
        self.notify_candidates();
        Ok(())
    }

    async fn upsert_selected_relay(&self, relay: SelectedRelay) -> ColumbaResult<()> {
        self.wait_until_writable().await;
        if self.fail_selected_writes.load(Ordering::SeqCst) {
            return Err(ColumbaError::store_write(
                "upsert_selected_relay",
                "simulated write failure",
            ));
        }
        *self.selected.lock() = Some(relay.clone());
        self.selected_writes.lock().push(relay);
        // The selected relay lives next to the candidate rows; observers of
        // the candidate list see this write too.
        self.notify_candidates();
        Ok(())
    }

    async fn selected_relay(&self) -> ColumbaResult<Option<SelectedRelay>> {
        Ok(self.selected.lock().clone())
    }

    async fn set_auto_select(&self, enabled: bool) -> ColumbaResult<()> {
        *self.auto_select.lock() = enabled;
        self.notify_auto_select();
        self.notify_candidates();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::candidate;

    #[tokio::test]
    async fn test_every_write_reemits_candidates() {
        let store = InMemoryRelayStore::with_candidates([candidate(1, 2)]);
        let mut stream = store.observe_candidates();
        assert_eq!(stream.next().await.unwrap().len(), 1);

        store
            .upsert_selected_relay(SelectedRelay {
                destination_id: candidate(1, 2).destination_id,
                display_name: "relay-1".to_string(),
                manual: false,
            })
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap(), vec![candidate(1, 2)]);
    }

    #[tokio::test]
    async fn test_auto_select_stream_starts_with_current_value() {
        let store = InMemoryRelayStore::new();
        store.set_auto_select(false).await.unwrap();
        let mut stream = store.observe_auto_select();
        assert_eq!(stream.next().await, Some(false));
        store.set_auto_select(true).await.unwrap();
        assert_eq!(stream.next().await, Some(true));
    }

    #[tokio::test]
    async fn test_paused_writes_wait_for_resume() {
        let store = Arc::new(InMemoryRelayStore::new());
        store.pause_selected_writes();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert_selected_relay(SelectedRelay {
                        destination_id: DestinationId::new([4; 16]),
                        display_name: "relay-4".to_string(),
                        manual: true,
                    })
                    .await
            })
        };

        while store.blocked_writes() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(store.current_selection().is_none());

        store.resume_selected_writes();
        writer.await.unwrap().unwrap();
        assert_eq!(store.selected_writes().len(), 1);
        assert_eq!(store.blocked_writes(), 0);
    }
}
