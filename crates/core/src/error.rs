use thiserror::Error;

use crate::controller::SessionState;

/// Protocol phase a failure occurred in, carried on [`ProtocolError`] so the
/// caller can tell a broken handshake apart from a broken step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Registration,
    StepLoop,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Handshake => write!(f, "handshake"),
            Phase::Registration => write!(f, "field registration"),
            Phase::StepLoop => write!(f, "step loop"),
        }
    }
}

/// Failures at the transport: bind, send, receive, timeout, cancellation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] zmq::Error),

    #[error("receive failed: {0}")]
    Recv(#[source] zmq::Error),

    #[error("timed out after {0:?} waiting for the peer")]
    Timeout(std::time::Duration),

    #[error("receive cancelled")]
    Cancelled,

    #[error("channel already closed")]
    Closed,
}

/// A received token outside the set legal for the current state, or an
/// operation invoked in a state where it must not touch the wire.
///
/// The protocol has no resynchronization primitive, so every variant is fatal
/// for the session; the only valid follow-up is `close()` and a new session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected token {token:?} during {phase} (state {state:?}, expected {expected})")]
    UnexpectedToken {
        token: String,
        phase: Phase,
        state: SessionState,
        expected: &'static str,
    },

    #[error("{op} is not legal in state {state:?}")]
    BadState {
        op: &'static str,
        state: SessionState,
    },
}

/// A value that fails to round-trip through the shared msgpack encoding.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("expected a single reply frame, got {0}")]
    FrameCount(usize),

    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unsupported msgpack value: {0}")]
    Unsupported(String),

    #[error("integer out of range for the value model: {0}")]
    IntRange(u64),

    #[error("malformed field id reply: {0}")]
    FieldId(String),

    #[error("clock value is not a timestamp: {0}")]
    Clock(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
