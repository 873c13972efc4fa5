//! Mock Engine for Testing
//!
//! Deterministic stand-in for the mesh engine. Start-up and teardown latency and
//! failures are scripted; every call is recorded so tests can assert on what the
//! runtime did, including calls that arrived after the engine was shut down.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use columba_core::{
    AnnounceEvent, ColumbaError, ColumbaResult, DestinationId, EngineConfig, EngineEvent,
    EngineEventSender, EngineFactory, IdentityInfo, MeshEngine, MessageReceipt, ReceivedMessage,
    Timestamp,
};
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};

// ----------------------------------------------------------------------------
// Mock Engine Script
// ----------------------------------------------------------------------------

/// Scripted behaviour of engines produced by [`MockEngineFactory`]
#[derive(Debug, Clone, Default)]
pub struct MockEngineScript {
    /// Time `start` takes before returning
    pub start_delay: Duration,
    /// Make `start` fail with this reason
    pub start_failure: Option<String>,
    /// Time `shutdown` takes before returning
    pub shutdown_delay: Duration,
    /// Make `set_outbound_relay` fail with this reason
    pub relay_failure: Option<String>,
    /// Time `set_outbound_relay` takes before returning
    pub relay_delay: Duration,
    /// Make `set_outbound_relay` panic, as a crashing native engine would
    pub relay_panic: bool,
}

impl MockEngineScript {
    /// Engine that starts and stops instantly
    pub fn instant() -> Self {
        Self::default()
    }

    /// Engine whose start-up takes `delay`
    pub fn slow_start(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    /// Engine that never comes up
    pub fn failing_start(reason: impl Into<String>) -> Self {
        Self {
            start_failure: Some(reason.into()),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Mock Engine
// ----------------------------------------------------------------------------

pub struct MockEngine {
    id: u64,
    events: EngineEventSender,
    script: MockEngineScript,
    identity: IdentityInfo,
    relay_calls: Mutex<Vec<Option<DestinationId>>>,
    relay_attempts: AtomicUsize,
    sent: Mutex<Vec<(DestinationId, String)>>,
    pending_announces: Mutex<Vec<AnnounceEvent>>,
    pending_messages: Mutex<Vec<ReceivedMessage>>,
    polls: AtomicUsize,
    announces: AtomicUsize,
    shut_down: AtomicBool,
    calls_after_shutdown: AtomicUsize,
}

impl MockEngine {
    fn new(id: u64, config: &EngineConfig, events: EngineEventSender, script: MockEngineScript) -> Self {
        let mut destination = [0u8; 16];
        destination[..8].copy_from_slice(&id.to_be_bytes());
        Self {
            id,
            events,
            script,
            identity: IdentityInfo {
                identity_hash: destination.to_vec(),
                delivery_destination: DestinationId::new(destination),
                display_name: config.display_name.clone(),
            },
            relay_calls: Mutex::new(Vec::new()),
            relay_attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            pending_announces: Mutex::new(Vec::new()),
            pending_messages: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            announces: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            calls_after_shutdown: AtomicUsize::new(0),
        }
    }

    /// Sequence number of this engine within its factory, starting at 1
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Every relay passed to `set_outbound_relay`, in call order
    pub fn relay_calls(&self) -> Vec<Option<DestinationId>> {
        self.relay_calls.lock().clone()
    }

    /// `set_outbound_relay` calls, including failed and panicked ones
    pub fn relay_attempts(&self) -> usize {
        self.relay_attempts.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<(DestinationId, String)> {
        self.sent.lock().clone()
    }

    /// Number of `poll_announces` calls
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn announce_count(&self) -> usize {
        self.announces.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Calls that reached this engine after `shutdown` had begun
    pub fn calls_after_shutdown(&self) -> usize {
        self.calls_after_shutdown.load(Ordering::SeqCst)
    }

    /// Queue an announce for the next `poll_announces`
    pub fn queue_announce(&self, announce: AnnounceEvent) {
        self.pending_announces.lock().push(announce);
    }

    /// Queue a message for the next `poll_messages`
    pub fn queue_message(&self, message: ReceivedMessage) {
        self.pending_messages.lock().push(message);
    }

    /// Push an event the way a live engine callback would; false once the
    /// session stopped listening
    pub fn push_event(&self, event: EngineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn record_call(&self, operation: &str) {
        if self.is_shut_down() {
            debug!("Mock engine {} called after shutdown: {}", self.id, operation);
            self.calls_after_shutdown.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl MeshEngine for MockEngine {
    async fn identity(&self) -> ColumbaResult<IdentityInfo> {
        self.record_call("identity");
        Ok(self.identity.clone())
    }

    async fn announce(&self) -> ColumbaResult<()> {
        self.record_call("announce");
        self.announces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(
        &self,
        destination: DestinationId,
        content: &str,
    ) -> ColumbaResult<MessageReceipt> {
        self.record_call("send_message");
        self.sent.lock().push((destination, content.to_string()));
        Ok(MessageReceipt {
            message_id: uuid::Uuid::new_v4().to_string(),
            destination,
            timestamp: Timestamp::now(),
        })
    }

    async fn poll_announces(&self) -> ColumbaResult<Vec<AnnounceEvent>> {
        self.record_call("poll_announces");
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(std::mem::take(&mut *self.pending_announces.lock()))
    }

    async fn poll_messages(&self) -> ColumbaResult<Vec<ReceivedMessage>> {
        self.record_call("poll_messages");
        Ok(std::mem::take(&mut *self.pending_messages.lock()))
    }

    async fn set_outbound_relay(&self, relay: Option<DestinationId>) -> ColumbaResult<()> {
        self.record_call("set_outbound_relay");
        self.relay_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.script.relay_delay.is_zero() {
            sleep(self.script.relay_delay).await;
        }
        if self.script.relay_panic {
            panic!("mock engine {} crashed in set_outbound_relay", self.id);
        }
        if let Some(reason) = &self.script.relay_failure {
            return Err(ColumbaError::call_failed("set_outbound_relay", reason.clone()));
        }
        self.relay_calls.lock().push(relay);
        Ok(())
    }

    async fn shutdown(&self) -> ColumbaResult<()> {
        info!("Mock engine {} shutting down", self.id);
        self.shut_down.store(true, Ordering::SeqCst);
        if !self.script.shutdown_delay.is_zero() {
            sleep(self.script.shutdown_delay).await;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Mock Engine Factory
// ----------------------------------------------------------------------------

/// Factory that hands out [`MockEngine`]s and keeps a handle to each
#[derive(Default)]
pub struct MockEngineFactory {
    script: Mutex<MockEngineScript>,
    engines: Mutex<Vec<Arc<MockEngine>>>,
    starts: AtomicUsize,
    next_id: AtomicU64,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: MockEngineScript) -> Self {
        let factory = Self::default();
        *factory.script.lock() = script;
        factory
    }

    /// Change the script for engines started from now on
    pub fn set_script(&self, script: MockEngineScript) {
        *self.script.lock() = script;
    }

    /// Number of `start` calls, including failed and abandoned ones
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Engines that finished starting, oldest first
    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl EngineFactory for MockEngineFactory {
    async fn start(
        &self,
        config: &EngineConfig,
        events: EngineEventSender,
    ) -> ColumbaResult<Arc<dyn MeshEngine>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();

        if !script.start_delay.is_zero() {
            sleep(script.start_delay).await;
        }
        if let Some(reason) = &script.start_failure {
            return Err(ColumbaError::start_failed(reason.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = Arc::new(MockEngine::new(id, config, events, script));
        self.engines.lock().push(engine.clone());
        debug!("Mock engine {} started", id);
        Ok(engine)
    }
}
