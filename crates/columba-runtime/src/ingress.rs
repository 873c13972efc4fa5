//! Event Ingress Task
//!
//! Single consumer of the per-session engine event channel. Propagation-node
//! announces become relay candidates in the store (which in turn feeds the
//! relay manager); everything else is fanned out as an [`AppEvent`].

use std::sync::Arc;

use columba_core::{ColumbaResult, EngineEvent, EngineEventReceiver, RelayCandidate, RelayStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::events::{emit, AppEvent, AppEventSender};

pub struct EventIngressTask {
    events: EngineEventReceiver,
    store: Arc<dyn RelayStore>,
    app_events: AppEventSender,
}

impl EventIngressTask {
    pub fn new(
        events: EngineEventReceiver,
        store: Arc<dyn RelayStore>,
        app_events: AppEventSender,
    ) -> Self {
        Self {
            events,
            store,
            app_events,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Event ingress task starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("Error handling engine event: {}", e);
                        }
                    }
                    None => {
                        debug!("Engine event channel closed, stopping ingress task");
                        break;
                    }
                }
            }
        }

        info!("Event ingress task stopped");
    }

    async fn handle_event(&mut self, event: EngineEvent) -> ColumbaResult<()> {
        match event {
            EngineEvent::Announce(announce) => {
                if let Some(candidate) = RelayCandidate::from_announce(&announce) {
                    trace!(
                        "Relay announce from {} ({} hops)",
                        candidate.destination_id.short(),
                        candidate.hop_count
                    );
                    self.store.upsert_candidate(candidate).await?;
                }
                emit(&self.app_events, AppEvent::AnnounceReceived { announce });
            }
            EngineEvent::MessageReceived(message) => {
                debug!("Message {} from {}", message.message_id, message.source.short());
                emit(&self.app_events, AppEvent::MessageReceived { message });
            }
            EngineEvent::DeliveryStatus(update) => {
                emit(&self.app_events, AppEvent::DeliveryStatus { update });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_app_event_channel;
    use columba_core::{create_engine_event_channel, DeliveryState, DeliveryStatusUpdate};
    use columba_harness::{fixtures, InMemoryRelayStore};

    #[tokio::test]
    async fn test_only_propagation_announces_become_candidates() {
        let store = Arc::new(InMemoryRelayStore::new());
        let (tx, rx) = create_engine_event_channel();
        let (app_tx, mut app_rx) = create_app_event_channel(16);
        let task = EventIngressTask::new(rx, store.clone(), app_tx);

        tx.send(EngineEvent::Announce(fixtures::peer_announce(1))).unwrap();
        tx.send(EngineEvent::Announce(fixtures::propagation_announce(2, 3))).unwrap();
        drop(tx);
        task.run(CancellationToken::new()).await;

        let candidates = store.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].destination_id, fixtures::destination(2));
        assert_eq!(candidates[0].display_name, "relay-2");
        assert_eq!(candidates[0].hop_count, 3);

        assert!(matches!(app_rx.recv().await, Ok(AppEvent::AnnounceReceived { .. })));
        assert!(matches!(app_rx.recv().await, Ok(AppEvent::AnnounceReceived { .. })));
    }

    #[tokio::test]
    async fn test_messages_and_delivery_updates_fan_out() {
        let store = Arc::new(InMemoryRelayStore::new());
        let (tx, rx) = create_engine_event_channel();
        let (app_tx, mut app_rx) = create_app_event_channel(16);
        let task = EventIngressTask::new(rx, store, app_tx);

        tx.send(EngineEvent::MessageReceived(fixtures::message(4, "hi"))).unwrap();
        tx.send(EngineEvent::DeliveryStatus(DeliveryStatusUpdate {
            message_id: "out-1".to_string(),
            state: DeliveryState::Delivered,
        }))
        .unwrap();
        drop(tx);
        task.run(CancellationToken::new()).await;

        match app_rx.recv().await.unwrap() {
            AppEvent::MessageReceived { message } => assert_eq!(message.content, "hi"),
            other => panic!("unexpected event {:?}", other),
        }
        match app_rx.recv().await.unwrap() {
            AppEvent::DeliveryStatus { update } => {
                assert_eq!(update.state, DeliveryState::Delivered)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
