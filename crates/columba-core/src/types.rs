//! Core types for the Columba service
//!
//! Destination identifiers, timestamps and the records that flow between the
//! engine, the relay store and the foreground.

use core::fmt;
use core::ops::Deref;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::ColumbaError;

/// Announce aspect emitted by propagation nodes (relay candidates)
pub const PROPAGATION_ASPECT: &str = "lxmf.propagation";

/// Announce aspect emitted by ordinary messaging peers
pub const DELIVERY_ASPECT: &str = "lxmf.delivery";

// ----------------------------------------------------------------------------
// Destination Identifier
// ----------------------------------------------------------------------------

/// Truncated destination hash addressing a peer or relay on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DestinationId([u8; 16]);

impl DestinationId {
    /// Length of a destination hash in bytes
    pub const LEN: usize = 16;

    /// Create a new DestinationId from 16 bytes
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create a DestinationId from a slice, which must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ColumbaError> {
        if bytes.len() != Self::LEN {
            return Err(ColumbaError::invalid_input(format!(
                "destination hash must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First eight hex characters, used in log lines and fallback names
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for DestinationId {
    type Err = ColumbaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean_str)
            .map_err(|_| ColumbaError::invalid_input("Invalid hex in DestinationId"))?;
        Self::from_slice(&bytes)
    }
}

impl Deref for DestinationId {
    type Target = [u8; 16];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond wall-clock timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Relay Candidates
// ----------------------------------------------------------------------------

/// A propagation node that may be selected to carry messages for us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCandidate {
    pub destination_id: DestinationId,
    pub display_name: String,
    pub hop_count: u8,
    pub public_key: Vec<u8>,
    /// When the most recent announce for this relay was seen
    pub last_seen: Timestamp,
}

impl RelayCandidate {
    /// Build a candidate from a propagation-node announce
    ///
    /// Returns `None` for announces of any other aspect.
    pub fn from_announce(announce: &AnnounceEvent) -> Option<Self> {
        if announce.aspect != PROPAGATION_ASPECT {
            return None;
        }
        let display_name = core::str::from_utf8(&announce.app_data)
            .ok()
            .map(str::trim)
            .filter(|name| !name.is_empty() && name.chars().all(|c| !c.is_control()))
            .map(str::to_string)
            .unwrap_or_else(|| announce.destination_id.short());

        Some(Self {
            destination_id: announce.destination_id,
            display_name,
            hop_count: announce.hops,
            public_key: announce.public_key.clone(),
            last_seen: announce.timestamp,
        })
    }
}

/// The persisted "currently selected relay" setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedRelay {
    pub destination_id: DestinationId,
    pub display_name: String,
    /// Chosen by the user rather than by automatic selection
    pub manual: bool,
}

// ----------------------------------------------------------------------------
// Engine Records
// ----------------------------------------------------------------------------

/// An announce observed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceEvent {
    pub destination_id: DestinationId,
    pub identity_hash: Vec<u8>,
    pub public_key: Vec<u8>,
    pub app_data: Vec<u8>,
    pub aspect: String,
    pub hops: u8,
    pub timestamp: Timestamp,
    /// Name of the interface the announce arrived on, when known
    pub interface: Option<String>,
}

/// A message delivered to one of our destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub source: DestinationId,
    pub content: String,
    pub timestamp: Timestamp,
}

/// Delivery progress of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusUpdate {
    pub message_id: String,
    pub state: DeliveryState,
}

/// Local identity as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub identity_hash: Vec<u8>,
    pub delivery_destination: DestinationId,
    pub display_name: String,
}

/// Receipt returned when the engine accepts an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub message_id: String,
    pub destination: DestinationId,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
