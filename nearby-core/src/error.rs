//! Errors returned by the session facade.

use crate::identity::NameError;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),
    #[error("no connected peers")]
    NoConnectedPeers,
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("transport failure: {0}")]
    Transport(TransportError),
    #[error("receive queue is empty")]
    EmptyQueue,
    #[error("session is not enabled")]
    Disabled,
    #[error("session is closed")]
    Closed,
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PayloadTooLarge { len, max } => {
                SessionError::PayloadTooLarge { len, max }
            }
            other => SessionError::Transport(other),
        }
    }
}

impl SessionError {
    /// Stable numeric code for C callers. 0 is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::InvalidName(_) => 1,
            SessionError::NoConnectedPeers => 2,
            SessionError::PayloadTooLarge { .. } => 3,
            SessionError::Transport(_) => 4,
            SessionError::EmptyQueue => 5,
            SessionError::Disabled => 6,
            SessionError::Closed => 7,
        }
    }
}
