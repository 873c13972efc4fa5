//! Columba Service Runtime
//!
//! Async half of the Columba service, built on the primitives in `columba-core`:
//! - `MeshService`: non-blocking initialize/shutdown call boundary with
//!   generation-gated completion
//! - `PollScheduler`: adaptive engine polling
//! - `RelayManager`: debounced, loop-protected automatic relay selection
//! - `EventIngressTask`: routes engine events into the relay store and app events
//! - `ServiceBinder`: foreground side of the process boundary

pub mod binder;
pub mod builder;
pub mod events;
pub mod ingress;
pub mod poller;
pub mod relay_manager;
mod service;

pub use binder::{CallResult, ResultCallback, ServiceBinder, SERVICE_DISCONNECTED};
pub use builder::ServiceBuilder;
pub use events::{create_app_event_channel, AppEvent, AppEventReceiver, AppEventSender};
pub use ingress::EventIngressTask;
pub use poller::PollScheduler;
pub use relay_manager::RelayManager;
pub use service::*;

// Re-export core types for convenience
pub use columba_core::{
    ColumbaError, ColumbaResult, DestinationId, EngineFactory, MeshEngine, ProcessStatus,
    RelayStore, ResourceProvider, SelectionState, ServiceConfig,
};
