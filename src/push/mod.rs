//! Real-time push channel.
//!
//! One socket per session delivers tagged JSON envelopes. The socket is a
//! [`RefCountedResource`](crate::sync::RefCountedResource): it is opened when
//! the first subscription is enabled and closed when the last one goes away.

pub mod channel;
pub mod protocol;
pub mod socket;

pub use channel::{PushChannel, Subscription};
pub use protocol::{PushEnvelope, PushKind, PushMessage};
pub use socket::{ChannelConnector, PushConnection, PushConnector, WebSocketConnector};

use crate::sync::SyncError;

/// Errors raised by the push layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("Malformed push frame: {0}")]
    Malformed(String),

    #[error("Push frame has no type tag")]
    MissingTag,

    #[error("Unknown push tag: {0}")]
    UnknownTag(String),

    #[error("Push frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Push connection failed: {0}")]
    Connect(String),
}

impl From<PushError> for SyncError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Connect(msg) => SyncError::Transport(msg),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}
