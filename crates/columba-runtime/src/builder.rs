//! Service Builder API
//!
//! Builder-style construction of a [`MeshService`] for consumers (CLI, app
//! glue, tests): plug in the engine factory and relay store, optionally a
//! resource provider, and get back a cloneable service handle.

use std::sync::Arc;

use columba_core::{
    ColumbaError, ColumbaResult, EngineFactory, EngineLifecycle, NoopResourceProvider,
    PollConfig, RelaySelectionConfig, RelayStore, ResourceProvider,
};
use tokio::runtime::Handle;
use tracing::info;

use crate::{
    events::{create_app_event_channel, APP_EVENT_CAPACITY},
    relay_manager::RelayManager,
    service::MeshService,
};

// ----------------------------------------------------------------------------
// Service Builder
// ----------------------------------------------------------------------------

pub struct ServiceBuilder {
    factory: Arc<dyn EngineFactory>,
    store: Arc<dyn RelayStore>,
    resources: Arc<dyn ResourceProvider>,
    relay_config: RelaySelectionConfig,
    poll_config: PollConfig,
    event_capacity: usize,
    runtime: Option<Handle>,
}

impl ServiceBuilder {
    pub fn new(factory: Arc<dyn EngineFactory>, store: Arc<dyn RelayStore>) -> Self {
        Self {
            factory,
            store,
            resources: Arc::new(NoopResourceProvider),
            relay_config: RelaySelectionConfig::default(),
            poll_config: PollConfig::default(),
            event_capacity: APP_EVENT_CAPACITY,
            runtime: None,
        }
    }

    /// Provider of the exclusive resources held while the engine runs
    pub fn with_resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = resources;
        self
    }

    /// Relay timing used until the first `initialize` supplies its own
    pub fn with_relay_config(mut self, config: RelaySelectionConfig) -> Self {
        self.relay_config = config;
        self
    }

    /// Poll timing used until the first session starts
    pub fn with_poll_config(mut self, config: PollConfig) -> Self {
        self.poll_config = config;
        self
    }

    /// Buffer size of the application event broadcast
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Runtime the background work is spawned on; defaults to the current one
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> ColumbaResult<MeshService> {
        self.relay_config.validate()?;
        self.poll_config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                ColumbaError::config_error("ServiceBuilder::build needs a tokio runtime")
            })?,
        };

        let lifecycle = Arc::new(EngineLifecycle::new());
        let (app_events, _) = create_app_event_channel(self.event_capacity);
        let relay = RelayManager::new(
            self.relay_config,
            self.store.clone(),
            lifecycle.clone(),
            app_events.clone(),
        );

        info!("Columba service built");
        Ok(MeshService::from_parts(
            lifecycle,
            self.factory,
            self.store,
            self.resources,
            relay,
            &self.poll_config,
            app_events,
            runtime,
        ))
    }
}
