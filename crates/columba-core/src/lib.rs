//! Columba Service Core
//!
//! Concurrency and lifecycle-coordination primitives for a mesh messaging client
//! whose networking engine runs as a long-lived background process:
//!
//! - [`lifecycle::LifecycleStore`]: process status, generation counter, engine
//!   handle and safety flags
//! - [`poll::AdaptivePollController`]: active/idle aware poll interval with
//!   exponential backoff
//! - [`relay::RelaySelector`]: relay selection phases, ranking and loop detection
//! - [`engine::MeshEngine`], [`store::RelayStore`], [`store::ResourceProvider`]:
//!   the collaborators the runtime drives
//!
//! The async runtime that drives these lives in `columba-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod poll;
pub mod relay;
pub mod status;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    EngineConfig, InterfaceConfig, LifecycleConfig, PollConfig, RelaySelectionConfig,
    ServiceConfig,
};
pub use engine::{
    create_engine_event_channel, with_engine, EngineEvent, EngineEventReceiver,
    EngineEventSender, EngineFactory, EngineLifecycle, MeshEngine,
};
pub use errors::{ColumbaError, ColumbaResult, EngineError, LifecycleError, StoreError};
pub use lifecycle::{LifecycleStore, ReadinessCallback, ResourceLease, TransitionOutcome};
pub use poll::{AdaptivePollController, PollState};
pub use relay::{RelaySelector, SelectionHistory, SelectionState};
pub use status::ProcessStatus;
pub use store::{NoopResourceProvider, RelayStore, ResourceProvider};
pub use types::{
    AnnounceEvent, DeliveryState, DeliveryStatusUpdate, DestinationId, IdentityInfo,
    MessageReceipt, ReceivedMessage, RelayCandidate, SelectedRelay, Timestamp,
    DELIVERY_ASPECT, PROPAGATION_ASPECT,
};
