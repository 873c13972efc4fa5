//! Mesh Engine Interface
//!
//! The networking engine is an opaque collaborator reached through
//! [`MeshEngine`]. Concrete engines (the real mesh stack, the test mock) live in
//! their own crates; the runtime only ever talks to `Arc<dyn MeshEngine>` handles
//! lent out by the [`LifecycleStore`].

use core::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    config::EngineConfig,
    errors::{ColumbaError, ColumbaResult},
    lifecycle::LifecycleStore,
    types::{
        AnnounceEvent, DeliveryStatusUpdate, DestinationId, IdentityInfo, MessageReceipt,
        ReceivedMessage,
    },
};

// ----------------------------------------------------------------------------
// Engine Events
// ----------------------------------------------------------------------------

/// Events pushed by a running engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Announce(AnnounceEvent),
    MessageReceived(ReceivedMessage),
    DeliveryStatus(DeliveryStatusUpdate),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Create the per-session engine event channel
pub fn create_engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Engine Traits
// ----------------------------------------------------------------------------

/// A running mesh networking engine
///
/// Every method may be slow or fail; callers bound them with timeouts where a
/// hang would block a lifecycle transition.
#[async_trait::async_trait]
pub trait MeshEngine: Send + Sync {
    /// Local identity and delivery destination
    async fn identity(&self) -> ColumbaResult<IdentityInfo>;

    /// Announce our delivery destination to the mesh
    async fn announce(&self) -> ColumbaResult<()>;

    async fn send_message(
        &self,
        destination: DestinationId,
        content: &str,
    ) -> ColumbaResult<MessageReceipt>;

    /// Drain announces observed since the last poll
    async fn poll_announces(&self) -> ColumbaResult<Vec<AnnounceEvent>>;

    /// Drain messages received since the last poll
    async fn poll_messages(&self) -> ColumbaResult<Vec<ReceivedMessage>>;

    /// Route outbound propagated messages through `relay`, or through none
    async fn set_outbound_relay(&self, relay: Option<DestinationId>) -> ColumbaResult<()>;

    /// Stop the engine and release its interfaces
    async fn shutdown(&self) -> ColumbaResult<()>;
}

/// Starts engines; one call per successful bring-up
#[async_trait::async_trait]
pub trait EngineFactory: Send + Sync {
    /// Start an engine that reports asynchronous events through `events`
    async fn start(
        &self,
        config: &EngineConfig,
        events: EngineEventSender,
    ) -> ColumbaResult<Arc<dyn MeshEngine>>;
}

// ----------------------------------------------------------------------------
// Guarded Calls
// ----------------------------------------------------------------------------

/// Lifecycle store specialised to the engine trait object
pub type EngineLifecycle = LifecycleStore<dyn MeshEngine>;

/// Run `call` against the engine if, and only if, calling it is safe right now
///
/// The handle is borrowed for the duration of the call only. When the
/// kill-switch is set or no engine is installed the call is skipped and
/// [`crate::EngineError::Unavailable`] is returned.
pub async fn with_engine<T, F, Fut>(
    lifecycle: &EngineLifecycle,
    operation: &str,
    call: F,
) -> ColumbaResult<T>
where
    F: FnOnce(Arc<dyn MeshEngine>) -> Fut,
    Fut: Future<Output = ColumbaResult<T>>,
{
    let Some(engine) = lifecycle.engine_for_call() else {
        trace!("Skipping engine call {}: engine unavailable", operation);
        return Err(ColumbaError::engine_unavailable());
    };
    call(engine).await
}
