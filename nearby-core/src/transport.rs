//! Transport capability: discovery plus message delivery, injected into the session.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::{LocalIdentity, PeerId, ServiceType};

/// Default payload ceiling for transports that do not set their own.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Delivery hint passed through to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendMode {
    /// Delivered in order or the link is torn down.
    Reliable,
    /// May be dropped, e.g. when the peer's outbound queue is full.
    BestEffort,
}

/// Notifications a transport pushes to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    MessageReceived(PeerId, Vec<u8>),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Channel a transport reports on; the receiver goes to the session's event loop.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("transport is shut down")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Discovery and delivery backend.
///
/// Implementations must not block on network I/O in any method: `send` hands the
/// payload to whatever delivers it and returns. Connection changes and inbound
/// payloads are reported on the transport's [`EventSender`].
pub trait Transport: Send + Sync {
    /// Start announcing `identity` so browsing peers can find and link to us.
    fn advertise(&self, identity: &LocalIdentity) -> Result<(), TransportError>;

    /// Start looking for peers advertising `service` and link to those found.
    fn browse(&self, service: &ServiceType) -> Result<(), TransportError>;

    /// Stop advertising and browsing. Existing links stay up.
    fn stop_discovery(&self);

    fn send(&self, peer: PeerId, payload: &[u8], mode: SendMode) -> Result<(), TransportError>;

    fn max_payload_len(&self) -> usize {
        DEFAULT_MAX_PAYLOAD_LEN
    }

    /// Tear down every link. No events are reported afterwards except the
    /// disconnects caused by the teardown itself.
    fn shutdown(&self);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn advertise(&self, identity: &LocalIdentity) -> Result<(), TransportError> {
        (**self).advertise(identity)
    }

    fn browse(&self, service: &ServiceType) -> Result<(), TransportError> {
        (**self).browse(service)
    }

    fn stop_discovery(&self) {
        (**self).stop_discovery()
    }

    fn send(&self, peer: PeerId, payload: &[u8], mode: SendMode) -> Result<(), TransportError> {
        (**self).send(peer, payload, mode)
    }

    fn max_payload_len(&self) -> usize {
        (**self).max_payload_len()
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}
