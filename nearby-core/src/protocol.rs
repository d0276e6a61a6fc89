//! Nearby LAN wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};
use crate::transport::SendMode;

/// Current protocol version. Carried in beacons and the link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence for a service type on the multicast group.
    Beacon {
        protocol_version: u8,
        peer_id: PeerId,
        public_key: PublicKey,
        service_type: String,
        display_name: String,
        listen_port: u16,
    },
    /// Unicast answer to a beacon from a browsing peer.
    DiscoveryResponse {
        protocol_version: u8,
        peer_id: PeerId,
        public_key: PublicKey,
        service_type: String,
        display_name: String,
        listen_port: u16,
    },
    /// First frame on a TCP link, sent in the clear by both sides.
    Hello {
        protocol_version: u8,
        peer_id: PeerId,
        public_key: PublicKey,
        service_type: String,
    },
    /// Application payload.
    Data { mode: SendMode, payload: Vec<u8> },
    /// Liveness heartbeat.
    Heartbeat,
    /// Graceful leave; the link closes after this frame.
    Leave,
}
