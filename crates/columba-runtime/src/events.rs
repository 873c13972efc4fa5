//! Application events
//!
//! Fan-out of everything the presentation layer may want to react to. Slow
//! receivers lag and lose the oldest events rather than stalling the runtime.

use columba_core::{
    AnnounceEvent, DeliveryStatusUpdate, ProcessStatus, ReceivedMessage, SelectedRelay,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const APP_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    StatusChanged { status: ProcessStatus },
    AnnounceReceived { announce: AnnounceEvent },
    MessageReceived { message: ReceivedMessage },
    DeliveryStatus { update: DeliveryStatusUpdate },
    RelaySelected { relay: SelectedRelay },
    RelayLoopDetected {
        selections_in_window: usize,
        backoff_ms: u64,
    },
}

pub type AppEventSender = broadcast::Sender<AppEvent>;
pub type AppEventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_app_event_channel(capacity: usize) -> (AppEventSender, AppEventReceiver) {
    broadcast::channel(capacity.max(1))
}

/// Send without caring whether anyone is listening
pub(crate) fn emit(sender: &AppEventSender, event: AppEvent) {
    let _ = sender.send(event);
}
