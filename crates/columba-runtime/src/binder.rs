//! Service Binder
//!
//! Foreground side of the process boundary. The background service can be
//! bound, die, and be bound again; calls made meanwhile fail fast instead of
//! hanging. Arguments and results cross as JSON and flat status tags, the way
//! they would over an IPC interface.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use columba_core::{
    ColumbaResult, DestinationId, LifecycleError, ReadinessCallback, ServiceConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::service::{CompletionCallback, MeshService};

/// Error text delivered to calls interrupted by the service dying
pub const SERVICE_DISCONNECTED: &str = "service disconnected";

/// Callback receiving a JSON-encoded [`CallResult`]
pub type ResultCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// JSON shape of every asynchronous call result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":"result serialization failed"}"#.to_string()
        })
    }

    pub fn from_json(json: &str) -> ColumbaResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<&ColumbaResult<()>> for CallResult {
    fn from(result: &ColumbaResult<()>) -> Self {
        match result {
            Ok(()) => CallResult::ok(),
            Err(e) => CallResult::failure(e.to_string()),
        }
    }
}

#[derive(Default)]
struct BinderState {
    service: Option<MeshService>,
    queued_readiness: Vec<ReadinessCallback>,
}

type PendingCalls = Arc<Mutex<HashMap<u64, ResultCallback>>>;

#[derive(Default)]
pub struct ServiceBinder {
    state: Mutex<BinderState>,
    pending: PendingCalls,
    next_call: AtomicU64,
}

impl ServiceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connect to `service`, replaying readiness registrations made while unbound
    pub fn bind(&self, service: MeshService) {
        let queued = {
            let mut state = self.state.lock();
            state.service = Some(service.clone());
            std::mem::take(&mut state.queued_readiness)
        };
        info!("Service bound ({} queued readiness callbacks)", queued.len());
        for callback in queued {
            service.register_readiness_callback(callback);
        }
    }

    pub fn rebind(&self, service: MeshService) {
        debug!("Rebinding service");
        self.bind(service);
    }

    /// The service process died; fail every call still waiting on it
    pub fn service_died(&self) {
        self.state.lock().service = None;
        let interrupted: Vec<_> = self.pending.lock().drain().map(|(_, cb)| cb).collect();
        warn!(
            "Service died with {} call(s) in flight",
            interrupted.len()
        );
        let result = CallResult::failure(SERVICE_DISCONNECTED).to_json();
        for callback in interrupted {
            callback(result.clone());
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().service.is_some()
    }

    /// Calls still awaiting their result
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    fn service(&self) -> ColumbaResult<MeshService> {
        self.state
            .lock()
            .service
            .clone()
            .ok_or_else(|| LifecycleError::ServiceUnavailable.into())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Initialize with a JSON [`ServiceConfig`]; `callback` receives a JSON
    /// [`CallResult`] exactly once
    pub fn initialize(&self, config_json: &str, callback: ResultCallback) {
        let config = match ServiceConfig::from_json(config_json) {
            Ok(config) => config,
            Err(e) => return callback(CallResult::failure(e.to_string()).to_json()),
        };
        let service = match self.service() {
            Ok(service) => service,
            Err(e) => return callback(CallResult::failure(e.to_string()).to_json()),
        };

        service.initialize(config, self.track(callback));
    }

    /// Restart with the last configuration; `callback` receives a JSON
    /// [`CallResult`] exactly once
    pub fn force_restart(&self, callback: ResultCallback) {
        let service = match self.service() {
            Ok(service) => service,
            Err(e) => return callback(CallResult::failure(e.to_string()).to_json()),
        };

        let config = match service.restart_config() {
            Ok(config) => config,
            Err(e) => return callback(CallResult::failure(e.to_string()).to_json()),
        };
        service.restart_with(config, self.track(callback));
    }

    pub fn shutdown(&self) -> ColumbaResult<()> {
        self.service()?.shutdown();
        Ok(())
    }

    /// Status tag such as `READY` or `ERROR:<message>`
    pub fn status(&self) -> ColumbaResult<String> {
        Ok(self.service()?.status_tag())
    }

    /// Fires once the service is ready; queued until bound if necessary
    pub fn register_readiness_callback(&self, callback: ReadinessCallback) {
        let mut state = self.state.lock();
        match state.service.clone() {
            Some(service) => {
                drop(state);
                service.register_readiness_callback(callback);
            }
            None => state.queued_readiness.push(callback),
        }
    }

    pub fn set_conversation_active(&self, active: bool) -> ColumbaResult<()> {
        self.service()?.set_conversation_active(active);
        Ok(())
    }

    /// Manual relay choice; `destination_hex` is the relay's 16-byte id in hex
    pub async fn set_manual_relay(&self, destination_hex: &str, display_name: &str) -> String {
        let result = self.manual_relay(destination_hex, display_name).await;
        CallResult::from(&result).to_json()
    }

    async fn manual_relay(&self, destination_hex: &str, display_name: &str) -> ColumbaResult<()> {
        let destination: DestinationId = destination_hex.parse()?;
        self.service()?
            .set_manual_relay(destination, display_name)
            .await
    }

    fn track(&self, callback: ResultCallback) -> CompletionCallback {
        let id = self.next_call.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(id, callback);
        let call = PendingCall {
            id,
            pending: self.pending.clone(),
        };

        // Forwards to the caller unless the service already died and the
        // caller was told so
        Box::new(move |result: ColumbaResult<()>| {
            if let Some(callback) = call.take() {
                callback(CallResult::from(&result).to_json());
            }
        })
    }
}

/// A call's slot in the pending map, cleared even if the service drops the
/// completion without running it (a superseded initialize)
struct PendingCall {
    id: u64,
    pending: PendingCalls,
}

impl PendingCall {
    fn take(&self) -> Option<ResultCallback> {
        self.pending.lock().remove(&self.id)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.take().is_some() {
            trace!("Call {} superseded without a result", self.id);
        }
    }
}
