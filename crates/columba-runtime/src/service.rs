//! Mesh Service
//!
//! The call boundary between the foreground application and the background
//! networking process. `initialize` and `shutdown` return immediately; the work
//! runs on the tokio runtime and reports back through a completion callback
//! and the observable [`ProcessStatus`].
//!
//! Every initialization attempt is tagged with a generation. A completion
//! whose generation is no longer current is dropped without touching status.
//! Attempts are serialized: a newer attempt waits for the older one to notice
//! it has been superseded, and for any in-flight engine teardown, before it
//! starts an engine of its own.

use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use columba_core::{
    create_engine_event_channel, with_engine, ColumbaError, ColumbaResult, DestinationId,
    EngineFactory, EngineLifecycle, IdentityInfo, LifecycleConfig, LifecycleError, MeshEngine,
    MessageReceipt, PollConfig, ProcessStatus, ReadinessCallback, RelayCandidate, RelayStore,
    ResourceProvider, ServiceConfig, TransitionOutcome,
};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex as AsyncMutex},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    events::{emit, AppEvent, AppEventReceiver, AppEventSender},
    ingress::EventIngressTask,
    poller::PollScheduler,
    relay_manager::RelayManager,
};

/// Completion callback of `initialize` and `force_restart`
pub type CompletionCallback = Box<dyn FnOnce(ColumbaResult<()>) + Send + 'static>;

/// The initialization attempt that currently owns the session
struct Attempt {
    generation: u64,
    token: CancellationToken,
}

pub(crate) struct ServiceInner {
    pub(crate) lifecycle: Arc<EngineLifecycle>,
    pub(crate) factory: Arc<dyn EngineFactory>,
    pub(crate) store: Arc<dyn RelayStore>,
    pub(crate) resources: Arc<dyn ResourceProvider>,
    pub(crate) relay: RelayManager,
    pub(crate) poller: Mutex<PollScheduler>,
    pub(crate) app_events: AppEventSender,
    pub(crate) runtime: Handle,
    attempt: Mutex<Option<Attempt>>,
    init_lock: AsyncMutex<()>,
    teardowns: watch::Sender<usize>,
    last_config: Mutex<Option<ServiceConfig>>,
}

/// Cloneable handle to the background service
#[derive(Clone)]
pub struct MeshService {
    inner: Arc<ServiceInner>,
}

impl MeshService {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        lifecycle: Arc<EngineLifecycle>,
        factory: Arc<dyn EngineFactory>,
        store: Arc<dyn RelayStore>,
        resources: Arc<dyn ResourceProvider>,
        relay: RelayManager,
        poll_config: &PollConfig,
        app_events: AppEventSender,
        runtime: Handle,
    ) -> Self {
        let (teardowns, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(ServiceInner {
                lifecycle,
                factory,
                store,
                resources,
                relay,
                poller: Mutex::new(PollScheduler::new(poll_config)),
                app_events,
                runtime,
                attempt: Mutex::new(None),
                init_lock: AsyncMutex::new(()),
                teardowns,
                last_config: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle calls
    // ------------------------------------------------------------------

    /// Start bringing the engine up with `config`; returns the new generation
    ///
    /// Returns immediately. `callback` receives the outcome, unless the attempt
    /// is superseded by a newer `initialize`, in which case it is dropped.
    pub fn initialize(&self, config: ServiceConfig, callback: CompletionCallback) -> u64 {
        let token = CancellationToken::new();
        // Generation and attempt change together, so a concurrent shutdown
        // always targets the attempt it cancels
        let (generation, previous) = {
            let mut attempt = self.inner.attempt.lock();
            let generation = self.inner.lifecycle.next_generation();
            let previous = attempt.replace(Attempt {
                generation,
                token: token.clone(),
            });
            (generation, previous)
        };
        if let Some(previous) = previous {
            debug!(
                "Generation {} supersedes generation {}",
                generation, previous.generation
            );
            previous.token.cancel();
        }
        *self.inner.last_config.lock() = Some(config.clone());
        info!("Initialization requested (generation {})", generation);

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            inner
                .run_initialization(generation, token, config, callback)
                .await;
        });
        generation
    }

    /// Stop the engine; returns immediately
    ///
    /// Engine calls are refused from the moment this returns. The status moves
    /// to `RESTARTING`, then to `SHUTDOWN` once the engine has been torn down,
    /// unless a newer `initialize` got there first.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Shut down, then initialize again with the last configuration
    pub fn force_restart(&self, callback: CompletionCallback) -> ColumbaResult<u64> {
        let config = self.restart_config()?;
        Ok(self.restart_with(config, callback))
    }

    /// Configuration the next `force_restart` would use
    pub(crate) fn restart_config(&self) -> ColumbaResult<ServiceConfig> {
        self.inner
            .last_config
            .lock()
            .clone()
            .ok_or_else(|| ColumbaError::config_error("force_restart before any initialize"))
    }

    pub(crate) fn restart_with(&self, config: ServiceConfig, callback: CompletionCallback) -> u64 {
        info!("Forced restart requested");
        self.shutdown();
        self.initialize(config, callback)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self) -> ProcessStatus {
        self.inner.lifecycle.status()
    }

    /// Status as its flat boundary tag, e.g. `READY` or `ERROR:<message>`
    pub fn status_tag(&self) -> String {
        self.status().to_string()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.inner.lifecycle.subscribe()
    }

    pub fn subscribe_events(&self) -> AppEventReceiver {
        self.inner.app_events.subscribe()
    }

    /// Fires exactly once, when the process next becomes (or already is) ready
    pub fn register_readiness_callback(&self, callback: ReadinessCallback) {
        self.inner.lifecycle.register_readiness_callback(callback);
    }

    pub fn generation(&self) -> u64 {
        self.inner.lifecycle.generation()
    }

    pub fn lifecycle(&self) -> &Arc<EngineLifecycle> {
        &self.inner.lifecycle
    }

    // ------------------------------------------------------------------
    // Foreground activity
    // ------------------------------------------------------------------

    pub fn set_conversation_active(&self, active: bool) {
        self.inner.lifecycle.set_conversation_active(active);
        let poller = self.inner.poller.lock().clone();
        if active {
            poller.mark_active();
        } else {
            poller.mark_idle();
        }
    }

    pub fn poller(&self) -> PollScheduler {
        self.inner.poller.lock().clone()
    }

    // ------------------------------------------------------------------
    // Engine calls
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        destination: DestinationId,
        content: &str,
    ) -> ColumbaResult<MessageReceipt> {
        self.ensure_ready()?;
        with_engine(&self.inner.lifecycle, "send_message", |engine| async move {
            engine.send_message(destination, content).await
        })
        .await
    }

    pub async fn identity(&self) -> ColumbaResult<IdentityInfo> {
        self.ensure_ready()?;
        with_engine(&self.inner.lifecycle, "identity", |engine| async move {
            engine.identity().await
        })
        .await
    }

    fn ensure_ready(&self) -> ColumbaResult<()> {
        if self.status().permits_engine_calls() {
            Ok(())
        } else {
            Err(ColumbaError::engine_unavailable())
        }
    }

    // ------------------------------------------------------------------
    // Relay selection
    // ------------------------------------------------------------------

    pub fn relay(&self) -> &RelayManager {
        &self.inner.relay
    }

    pub async fn set_manual_relay(
        &self,
        destination: DestinationId,
        display_name: impl Into<String>,
    ) -> ColumbaResult<()> {
        self.inner.relay.set_manual_relay(destination, display_name).await
    }

    pub async fn enable_auto_select(&self) -> ColumbaResult<()> {
        self.inner.relay.enable_auto_select().await
    }

    pub fn alternative_relay(&self, excluding: &HashSet<DestinationId>) -> Option<RelayCandidate> {
        self.inner.relay.alternative_relay(excluding)
    }
}

impl ServiceInner {
    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    async fn run_initialization(
        self: Arc<Self>,
        generation: u64,
        token: CancellationToken,
        config: ServiceConfig,
        callback: CompletionCallback,
    ) {
        let outcome = AssertUnwindSafe(self.bring_up(generation, &token, &config))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("Initialization of generation {} panicked", generation);
                if self.lifecycle.is_current(generation) {
                    self.retire_session(config.lifecycle.teardown_timeout()).await;
                }
                Err(ColumbaError::start_failed("initialization panicked"))
            }
        };

        match result {
            Ok(()) => callback(Ok(())),
            Err(e) if e.is_stale() || !self.lifecycle.is_current(generation) => {
                trace!("Dropping result of superseded generation {}: {}", generation, e);
            }
            Err(e) if token.is_cancelled() => {
                debug!("Initialization of generation {} cancelled", generation);
                callback(Err(e));
            }
            Err(e) => {
                warn!("Initialization of generation {} failed: {}", generation, e);
                match self.transition(generation, ProcessStatus::Error(e.to_string())) {
                    TransitionOutcome::Stale { .. } => {
                        trace!("Dropping failure of superseded generation {}", generation);
                    }
                    _ => callback(Err(e)),
                }
            }
        }
    }

    async fn bring_up(
        &self,
        generation: u64,
        token: &CancellationToken,
        config: &ServiceConfig,
    ) -> ColumbaResult<()> {
        let _serial = self.init_lock.lock().await;
        self.ensure_live(generation, token)?;

        if let TransitionOutcome::Stale { captured, current } =
            self.transition(generation, ProcessStatus::Initializing)
        {
            return Err(LifecycleError::StaleGeneration { captured, current }.into());
        }

        config.validate()?;
        let lifecycle_config = &config.lifecycle;
        self.retire_session(lifecycle_config.teardown_timeout()).await;
        self.wait_for_teardown(lifecycle_config.teardown_timeout())
            .await?;
        self.ensure_live(generation, token)?;

        // Engine
        self.relay.reconfigure(config.relay.clone());
        let (events_tx, events_rx) = create_engine_event_channel();
        let startup = lifecycle_config.startup_timeout();
        let engine = tokio::select! {
            _ = token.cancelled() => return Err(self.interruption(generation)),
            started = timeout(startup, self.factory.start(&config.engine, events_tx.clone())) => {
                match started {
                    Ok(Ok(engine)) => engine,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(ColumbaError::engine_timeout(
                            "start",
                            startup.as_millis() as u64,
                        ))
                    }
                }
            }
        };
        debug!("Engine started for generation {}", generation);

        // Exclusive resources
        let mut leases = Vec::with_capacity(lifecycle_config.exclusive_resources.len());
        for resource in &lifecycle_config.exclusive_resources {
            match self.resources.acquire(resource) {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    drop(leases);
                    self.stop_engine(engine, lifecycle_config.teardown_timeout())
                        .await;
                    return Err(e);
                }
            }
        }

        // Install, unless shutdown or a newer attempt intervened
        let installed = {
            let attempt = self.attempt.lock();
            let live = matches!(
                attempt.as_ref(),
                Some(a) if a.generation == generation && !a.token.is_cancelled()
            );
            if live {
                self.lifecycle.clear_shutdown_started();
                self.lifecycle.install_engine(engine.clone());
                for lease in leases.drain(..) {
                    self.lifecycle.hold_lease(lease);
                }
            }
            live
        };
        if !installed {
            drop(leases);
            self.stop_engine(engine, lifecycle_config.teardown_timeout())
                .await;
            return Err(self.interruption(generation));
        }

        // Session tasks
        let poller = self.session_poller(&config.poll);
        let ingress = EventIngressTask::new(events_rx, self.store.clone(), self.app_events.clone());
        self.lifecycle
            .track_job(self.runtime.spawn(ingress.run(token.clone())));
        self.lifecycle.track_job(self.runtime.spawn(poller.run(
            self.lifecycle.clone(),
            events_tx,
            token.clone(),
        )));
        let relay = self.relay.clone();
        let relay_token = token.clone();
        self.lifecycle
            .track_job(self.runtime.spawn(async move { relay.run(relay_token).await }));

        if let Err(e) = self.relay.restore_selected().await {
            warn!("Could not restore selected relay: {}", e);
        }
        if config.engine.announce_on_start {
            if let Err(e) = with_engine(&self.lifecycle, "announce", |engine| async move {
                engine.announce().await
            })
            .await
            {
                warn!("Initial announce failed: {}", e);
            }
        }

        match self.transition(generation, ProcessStatus::Ready) {
            TransitionOutcome::Applied => {
                info!("Service ready (generation {})", generation);
                Ok(())
            }
            TransitionOutcome::Stale { captured, current } => {
                self.retire_session(lifecycle_config.teardown_timeout()).await;
                Err(LifecycleError::StaleGeneration { captured, current }.into())
            }
            TransitionOutcome::Rejected { .. } => Err(self.interruption(generation)),
        }
    }

    /// Stale if superseded, cancelled if shut down
    fn ensure_live(&self, generation: u64, token: &CancellationToken) -> ColumbaResult<()> {
        if !self.lifecycle.is_current(generation) || token.is_cancelled() {
            return Err(self.interruption(generation));
        }
        Ok(())
    }

    fn interruption(&self, generation: u64) -> ColumbaError {
        let current = self.lifecycle.generation();
        if current != generation {
            LifecycleError::StaleGeneration {
                captured: generation,
                current,
            }
            .into()
        } else {
            LifecycleError::Cancelled.into()
        }
    }

    /// Fresh poll scheduler for a new session, carrying the conversation flag over
    fn session_poller(&self, config: &PollConfig) -> PollScheduler {
        let poller = PollScheduler::new(config);
        if self.lifecycle.is_conversation_active() {
            poller.mark_active();
        }
        *self.poller.lock() = poller.clone();
        poller
    }

    async fn wait_for_teardown(&self, limit: Duration) -> ColumbaResult<()> {
        let mut teardowns = self.teardowns.subscribe();
        if *teardowns.borrow() == 0 {
            return Ok(());
        }
        debug!("Waiting for engine teardown to finish");
        let waited = timeout(limit, teardowns.wait_for(|running| *running == 0))
            .await
            .map(|_| ());
        match waited {
            Ok(()) => Ok(()),
            Err(_) => Err(ColumbaError::engine_timeout(
                "teardown",
                limit.as_millis() as u64,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn shutdown(self: &Arc<Self>) {
        let teardown = self.teardown_timeout();

        let (generation, engine) = {
            let mut attempt = self.attempt.lock();
            let generation = self.lifecycle.generation();
            if let Some(attempt) = attempt.take() {
                attempt.token.cancel();
            }

            let engine = self.lifecycle.take_engine();
            if engine.is_none() && self.lifecycle.status() == ProcessStatus::Shutdown {
                debug!("Shutdown requested while already shut down");
                return;
            }

            self.lifecycle.mark_shutdown_started();
            self.lifecycle.abort_jobs();
            let released = self.lifecycle.release_leases();
            self.transition(generation, ProcessStatus::Restarting);
            self.teardowns.send_modify(|running| *running += 1);
            info!(
                "Shutting down generation {} ({} resources released)",
                generation, released
            );
            (generation, engine)
        };
        self.poller.lock().controller().reset();

        let inner = self.clone();
        self.runtime.spawn(async move {
            if let Some(engine) = engine {
                inner.stop_engine(engine, teardown).await;
            }
            inner.teardowns.send_modify(|running| *running -= 1);
            match inner.transition(generation, ProcessStatus::Shutdown) {
                TransitionOutcome::Applied => info!("Service shut down"),
                TransitionOutcome::Stale { current, .. } => {
                    debug!("Teardown finished after generation {} started", current)
                }
                TransitionOutcome::Rejected { from, .. } => {
                    debug!("Teardown finished while {}", from)
                }
            }
        });
    }

    /// Tear down whatever an older session left installed
    async fn retire_session(&self, limit: Duration) {
        self.lifecycle.abort_jobs();
        let released = self.lifecycle.release_leases();
        if let Some(engine) = self.lifecycle.take_engine() {
            info!(
                "Retiring engine of a previous session ({} resources released)",
                released
            );
            self.stop_engine(engine, limit).await;
        }
    }

    async fn stop_engine(&self, engine: Arc<dyn MeshEngine>, limit: Duration) {
        match timeout(limit, engine.shutdown()).await {
            Ok(Ok(())) => debug!("Engine stopped"),
            Ok(Err(e)) => warn!("Engine teardown failed: {}", e),
            Err(_) => warn!("Engine teardown timed out after {}ms", limit.as_millis()),
        }
    }

    fn teardown_timeout(&self) -> Duration {
        self.last_config
            .lock()
            .as_ref()
            .map(|config| config.lifecycle.teardown_timeout())
            .unwrap_or_else(|| LifecycleConfig::default().teardown_timeout())
    }

    fn transition(&self, generation: u64, status: ProcessStatus) -> TransitionOutcome {
        let outcome = self.lifecycle.transition(generation, status.clone());
        if outcome.is_applied() {
            emit(&self.app_events, AppEvent::StatusChanged { status });
        }
        outcome
    }
}
