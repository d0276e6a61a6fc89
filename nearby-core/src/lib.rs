//! Nearby peer session: a lock-guarded facade over a pluggable discovery/transport backend.
//! The facade owns the local identity, the connected-peer registry and the inbound FIFO;
//! transports report connection changes and payloads as events.

pub mod crypto;
pub mod error;
pub mod identity;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wire;

pub use error::SessionError;
pub use identity::{Keypair, LocalIdentity, NameError, PeerId, PeerName, PublicKey, ServiceType};
pub use memory::{MemoryHub, MemoryTransport};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{Lifecycle, NearbySession, ReceivedMessage, SessionStats};
pub use transport::{
    event_channel, EventReceiver, EventSender, SendMode, Transport, TransportError, TransportEvent,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
