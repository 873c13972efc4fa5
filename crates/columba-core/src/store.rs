//! Persistence and platform resource interfaces
//!
//! [`RelayStore`] is the reactive settings/candidate store the relay manager
//! observes. Implementations are allowed to be "trigger-happy": a write to any
//! relay-related row may re-emit the whole candidate list. The relay selection
//! state machine is built to tolerate exactly that.

use futures::stream::BoxStream;

use crate::{
    errors::ColumbaResult,
    lifecycle::ResourceLease,
    types::{RelayCandidate, SelectedRelay},
};

/// Reactive store of relay candidates and the relay-selection settings
#[async_trait::async_trait]
pub trait RelayStore: Send + Sync {
    /// Current candidate list, re-emitted whenever the underlying table changes
    fn observe_candidates(&self) -> BoxStream<'static, Vec<RelayCandidate>>;

    /// Current auto-select setting, re-emitted when it changes
    fn observe_auto_select(&self) -> BoxStream<'static, bool>;

    /// Insert or refresh a candidate learned from an announce
    async fn upsert_candidate(&self, candidate: RelayCandidate) -> ColumbaResult<()>;

    /// Persist the selected relay
    async fn upsert_selected_relay(&self, relay: SelectedRelay) -> ColumbaResult<()>;

    async fn selected_relay(&self) -> ColumbaResult<Option<SelectedRelay>>;

    async fn set_auto_select(&self, enabled: bool) -> ColumbaResult<()>;
}

/// Source of exclusive platform resources held while the engine runs
///
/// Typical resources are a multicast lock for interface discovery and a wake
/// lock that keeps polling alive. A lease releases its resource on drop.
pub trait ResourceProvider: Send + Sync {
    fn acquire(&self, resource: &str) -> ColumbaResult<ResourceLease>;
}

/// Provider whose leases hold nothing; for hosts without such resources
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResourceProvider;

impl ResourceProvider for NoopResourceProvider {
    fn acquire(&self, resource: &str) -> ColumbaResult<ResourceLease> {
        Ok(ResourceLease::new(resource, || {}))
    }
}
