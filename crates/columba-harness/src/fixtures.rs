//! Test fixtures: destinations, announces and candidates keyed by a small integer

use columba_core::{
    AnnounceEvent, DestinationId, ReceivedMessage, RelayCandidate, Timestamp, DELIVERY_ASPECT,
    PROPAGATION_ASPECT,
};

pub fn destination(n: u8) -> DestinationId {
    DestinationId::new([n; 16])
}

/// Propagation-node announce for relay `n`, named `relay-n`
pub fn propagation_announce(n: u8, hops: u8) -> AnnounceEvent {
    AnnounceEvent {
        destination_id: destination(n),
        identity_hash: vec![n; 16],
        public_key: vec![n; 64],
        app_data: format!("relay-{}", n).into_bytes(),
        aspect: PROPAGATION_ASPECT.to_string(),
        hops,
        timestamp: Timestamp::new(1_700_000_000_000 + n as u64),
        interface: Some("auto".to_string()),
    }
}

/// Announce of a peer's delivery destination; never a relay candidate
pub fn peer_announce(n: u8) -> AnnounceEvent {
    AnnounceEvent {
        aspect: DELIVERY_ASPECT.to_string(),
        app_data: format!("peer-{}", n).into_bytes(),
        ..propagation_announce(n, 1)
    }
}

pub fn candidate(n: u8, hops: u8) -> RelayCandidate {
    RelayCandidate {
        destination_id: destination(n),
        display_name: format!("relay-{}", n),
        hop_count: hops,
        public_key: vec![n; 64],
        last_seen: Timestamp::new(1_700_000_000_000),
    }
}

pub fn message(n: u8, content: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: format!("msg-{}", n),
        source: destination(n),
        content: content.to_string(),
        timestamp: Timestamp::new(1_700_000_000_000),
    }
}
