//! Lifecycle State Store
//!
//! Process-wide record of the background process: status, generation counter,
//! engine handle, safety flags, held resources and session jobs.
//!
//! Every operation is total and non-blocking. Status changes are serialized by
//! one short critical section; the generation counter is a single atomic. A
//! generation-gated transition reads the generation *inside* the status lock, so
//! a completion carrying a superseded generation can never overwrite the status
//! of the attempt that replaced it.
//!
//! Two fields deliberately survive [`LifecycleStore::reset`]: the generation
//! counter and the `engine_shutdown_started` kill-switch.

use core::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::status::ProcessStatus;

/// Callback fired once when the process becomes usable
pub type ReadinessCallback = Box<dyn FnOnce() + Send + 'static>;

// ----------------------------------------------------------------------------
// Resource Leases
// ----------------------------------------------------------------------------

/// An exclusive resource held for the engine's lifetime, released on drop
pub struct ResourceLease {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ResourceLease {
    pub fn new<F>(name: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            trace!("Releasing resource {}", self.name);
            release();
        }
    }
}

impl fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease").field("name", &self.name).finish()
    }
}

// ----------------------------------------------------------------------------
// Transition Outcome
// ----------------------------------------------------------------------------

/// Result of a generation-gated status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The captured generation is no longer current; nothing changed
    Stale { captured: u64, current: u64 },
    /// The move is not legal from the current status; nothing changed
    Rejected { from: ProcessStatus, to: ProcessStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

struct StatusCell {
    status: ProcessStatus,
    readiness: Vec<ReadinessCallback>,
}

// ----------------------------------------------------------------------------
// Lifecycle Store
// ----------------------------------------------------------------------------

/// Owner of all mutable process-wide lifecycle state
///
/// `E` is the engine handle type; the store is the only owner of the handle and
/// lends it out one call at a time through [`LifecycleStore::engine_for_call`].
pub struct LifecycleStore<E: ?Sized> {
    status: Mutex<StatusCell>,
    status_tx: watch::Sender<ProcessStatus>,
    generation: AtomicU64,
    engine: RwLock<Option<Arc<E>>>,
    conversation_active: AtomicBool,
    engine_shutdown_started: AtomicBool,
    leases: Mutex<Vec<ResourceLease>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: ?Sized> Default for LifecycleStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ?Sized> LifecycleStore<E> {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ProcessStatus::Shutdown);
        Self {
            status: Mutex::new(StatusCell {
                status: ProcessStatus::Shutdown,
                readiness: Vec::new(),
            }),
            status_tx,
            generation: AtomicU64::new(0),
            engine: RwLock::new(None),
            conversation_active: AtomicBool::new(false),
            engine_shutdown_started: AtomicBool::new(false),
            leases: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self) -> ProcessStatus {
        self.status.lock().status.clone()
    }

    /// Observable status for the presentation layer
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    /// Unconditional status write
    pub fn set_status(&self, status: ProcessStatus) {
        let ready = {
            let mut cell = self.status.lock();
            self.apply_locked(&mut cell, status)
        };
        fire(ready);
    }

    /// Write `new` only if the current status equals `expected`
    pub fn compare_and_set_status(&self, expected: &ProcessStatus, new: ProcessStatus) -> bool {
        let ready = {
            let mut cell = self.status.lock();
            if &cell.status != expected {
                return false;
            }
            self.apply_locked(&mut cell, new)
        };
        fire(ready);
        true
    }

    /// Apply `status` on behalf of the attempt identified by `generation`
    ///
    /// Stale generations and illegal moves leave the status untouched.
    pub fn transition(&self, generation: u64, status: ProcessStatus) -> TransitionOutcome {
        let ready = {
            let mut cell = self.status.lock();
            let current = self.generation.load(Ordering::SeqCst);
            if current != generation {
                trace!(
                    "Dropping stale transition to {} (generation {} != {})",
                    status,
                    generation,
                    current
                );
                return TransitionOutcome::Stale {
                    captured: generation,
                    current,
                };
            }
            if !cell.status.can_transition_to(&status) {
                warn!("Rejected status transition {} -> {}", cell.status, status);
                return TransitionOutcome::Rejected {
                    from: cell.status.clone(),
                    to: status,
                };
            }
            self.apply_locked(&mut cell, status)
        };
        fire(ready);
        TransitionOutcome::Applied
    }

    /// Register a callback fired exactly once when the status becomes READY
    ///
    /// Fires immediately (on the caller's thread) if the process is already ready.
    pub fn register_readiness_callback(&self, callback: ReadinessCallback) {
        let mut cell = self.status.lock();
        if cell.status == ProcessStatus::Ready {
            drop(cell);
            callback();
        } else {
            cell.readiness.push(callback);
        }
    }

    pub fn pending_readiness_callbacks(&self) -> usize {
        self.status.lock().readiness.len()
    }

    fn apply_locked(&self, cell: &mut StatusCell, status: ProcessStatus) -> Vec<ReadinessCallback> {
        debug!("Process status {} -> {}", cell.status, status);
        cell.status = status.clone();
        let ready = if status == ProcessStatus::Ready {
            std::mem::take(&mut cell.readiness)
        } else {
            Vec::new()
        };
        self.status_tx.send_replace(status);
        ready
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new attempt; returns the new generation
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    // ------------------------------------------------------------------
    // Engine handle and safety flags
    // ------------------------------------------------------------------

    /// True iff the kill-switch is off and an engine is installed
    ///
    /// The kill-switch is consulted first; a present handle never overrides it.
    pub fn is_engine_call_safe(&self) -> bool {
        if self.engine_shutdown_started.load(Ordering::SeqCst) {
            return false;
        }
        self.engine.read().is_some()
    }

    /// Lend the engine for one call, or `None` when calling it is unsafe
    ///
    /// Callers must drop the returned handle when the call completes.
    pub fn engine_for_call(&self) -> Option<Arc<E>> {
        if self.engine_shutdown_started.load(Ordering::SeqCst) {
            return None;
        }
        self.engine.read().clone()
    }

    pub fn has_engine(&self) -> bool {
        self.engine.read().is_some()
    }

    pub fn install_engine(&self, engine: Arc<E>) {
        *self.engine.write() = Some(engine);
    }

    /// Remove the engine handle, typically to hand it to teardown
    pub fn take_engine(&self) -> Option<Arc<E>> {
        self.engine.write().take()
    }

    pub fn mark_shutdown_started(&self) {
        self.engine_shutdown_started.store(true, Ordering::SeqCst);
    }

    /// Explicitly drop the kill-switch; `reset` never does this
    pub fn clear_shutdown_started(&self) {
        self.engine_shutdown_started.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown_started(&self) -> bool {
        self.engine_shutdown_started.load(Ordering::SeqCst)
    }

    pub fn set_conversation_active(&self, active: bool) {
        self.conversation_active.store(active, Ordering::SeqCst);
    }

    pub fn is_conversation_active(&self) -> bool {
        self.conversation_active.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Resources and jobs
    // ------------------------------------------------------------------

    pub fn hold_lease(&self, lease: ResourceLease) {
        self.leases.lock().push(lease);
    }

    pub fn held_leases(&self) -> usize {
        self.leases.lock().len()
    }

    /// Release every held lease; returns how many were released
    pub fn release_leases(&self) -> usize {
        let leases = std::mem::take(&mut *self.leases.lock());
        let count = leases.len();
        drop(leases);
        count
    }

    /// Track a session job so `reset` and `abort_jobs` can stop it
    pub fn track_job(&self, job: JoinHandle<()>) {
        let mut jobs = self.jobs.lock();
        jobs.retain(|job| !job.is_finished());
        jobs.push(job);
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().iter().filter(|job| !job.is_finished()).count()
    }

    pub fn abort_jobs(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        for job in jobs {
            job.abort();
        }
    }

    /// Clear handle, conversation flag, leases and jobs
    ///
    /// Idempotent. Generation and the shutdown kill-switch are preserved.
    pub fn reset(&self) {
        self.take_engine();
        self.conversation_active.store(false, Ordering::SeqCst);
        self.release_leases();
        self.abort_jobs();
    }
}

fn fire(callbacks: Vec<ReadinessCallback>) {
    for callback in callbacks {
        callback();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
