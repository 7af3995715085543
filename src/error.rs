//! Error taxonomy for the protocol client.
//!
//! Packet-level variants ([`MuseError::MalformedPacket`],
//! [`MuseError::ResponseTooLarge`], [`MuseError::InvalidResponse`]) are
//! counted and logged by the session and never end a stream.  Connection-level
//! variants ([`MuseError::HandshakeFailed`], [`MuseError::Transport`]) move the
//! session to [`crate::types::ConnectionState::Faulted`].

use thiserror::Error;

use crate::protocol::Channel;
use crate::session::SessionEvent;
use crate::types::ConnectionState;

#[derive(Debug, Error)]
pub enum MuseError {
    /// Command token rejected by the codec before anything was written.
    #[error("invalid command {token:?}: {reason}")]
    InvalidCommand { token: String, reason: &'static str },

    /// Sensor payload with the wrong length or for the wrong decoder.
    #[error("malformed packet on {channel}: {reason}")]
    MalformedPacket { channel: Channel, reason: String },

    /// Control response did not close within the fragment bound.
    #[error("control response exceeded {fragments} fragments without closing")]
    ResponseTooLarge { fragments: usize },

    /// Control response closed its braces but is not a JSON object.
    #[error("control response is not valid JSON: {0}")]
    InvalidResponse(String),

    /// Phase two enumeration did not expose every required channel.
    #[error("handshake failed: missing channels {missing:?}")]
    HandshakeFailed { missing: Vec<Channel> },

    /// Connect / subscribe / write failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: SessionEvent,
    },

    /// The streaming loop was started outside `Streaming`.
    #[error("session is not streaming (state {0:?})")]
    NotStreaming(ConnectionState),

    /// The streaming loop is not draining queued commands.
    #[error("command queue full")]
    CommandQueueFull,

    /// A stop request interrupted a connect or stream in progress.
    #[error("session stopped")]
    Stopped,
}

impl From<btleplug::Error> for MuseError {
    fn from(e: btleplug::Error) -> Self {
        MuseError::Transport(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MuseError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MuseError::Transport("operation timed out".into())
    }
}

pub type Result<T> = std::result::Result<T, MuseError>;
