//! Poll Scheduler
//!
//! Periodically drains announces and messages from the engine. The interval
//! comes from the [`AdaptivePollController`]: short while a conversation is on
//! screen, backing off exponentially while idle. Marking a conversation active
//! wakes the loop immediately instead of waiting out a long idle interval.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use columba_core::{
    with_engine, AdaptivePollController, EngineEvent, EngineEventSender, EngineLifecycle,
    PollConfig,
};
use tokio::{sync::Notify, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Cheap, cloneable handle to the poll loop
#[derive(Clone)]
pub struct PollScheduler {
    controller: Arc<AdaptivePollController>,
    wake: Arc<Notify>,
    cycles: Arc<AtomicU64>,
}

impl PollScheduler {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            controller: Arc::new(AdaptivePollController::new(config)),
            wake: Arc::new(Notify::new()),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn controller(&self) -> &AdaptivePollController {
        &self.controller
    }

    /// Conversation on screen: poll at the minimum interval, starting now
    pub fn mark_active(&self) {
        self.controller.mark_active();
        self.wake.notify_one();
    }

    pub fn mark_idle(&self) {
        self.controller.mark_idle();
    }

    /// Completed poll cycles that reached the engine
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run until `cancel` fires
    ///
    /// Polled records are forwarded on `events`, the same channel engine
    /// callbacks use, so both paths share one ingress.
    pub async fn run(
        self,
        lifecycle: Arc<EngineLifecycle>,
        events: EngineEventSender,
        cancel: CancellationToken,
    ) {
        info!("Poll scheduler starting");

        loop {
            let delay = self.controller.next_interval();
            trace!("Next poll in {}ms", delay.as_millis());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
                _ = self.wake.notified() => {
                    debug!("Poll scheduler woken early");
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            self.poll_once(&lifecycle, &events).await;
        }

        info!("Poll scheduler stopped");
    }

    async fn poll_once(&self, lifecycle: &EngineLifecycle, events: &EngineEventSender) {
        if !lifecycle.is_engine_call_safe() {
            trace!("Skipping poll: engine not callable");
            return;
        }

        match with_engine(lifecycle, "poll_announces", |engine| async move {
            engine.poll_announces().await
        })
        .await
        {
            Ok(announces) => {
                for announce in announces {
                    let _ = events.send(EngineEvent::Announce(announce));
                }
            }
            Err(e) => warn!("Announce poll failed: {}", e),
        }

        match with_engine(lifecycle, "poll_messages", |engine| async move {
            engine.poll_messages().await
        })
        .await
        {
            Ok(messages) => {
                for message in messages {
                    let _ = events.send(EngineEvent::MessageReceived(message));
                }
            }
            Err(e) => warn!("Message poll failed: {}", e),
        }

        self.cycles.fetch_add(1, Ordering::SeqCst);
    }
}
