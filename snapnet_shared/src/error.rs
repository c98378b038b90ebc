//! Error types for the wire layer.
//!
//! Every variant except `Io` describes a protocol or local resource fault.
//! Transient conditions (stale deltas, duplicate commands) are not errors and
//! never show up here.

use thiserror::Error;

/// Result alias used throughout the wire layer.
pub type NetResult<T> = Result<T, NetError>;

/// Wire and connection errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Read past the end of a message.
    #[error("truncated message: wanted {wanted} bits, {remaining} remaining")]
    TruncatedMessage { wanted: u32, remaining: usize },

    /// Write past the capacity of an outgoing buffer.
    #[error("buffer overflow: {needed} bits needed, capacity {capacity} bytes")]
    BufferOverflow { needed: usize, capacity: usize },

    /// A delta record that cannot belong to the negotiated field table.
    #[error("malformed delta for {table}: {reason}")]
    MalformedDelta { table: &'static str, reason: String },

    #[error("bad opcode {0}")]
    BadOpcode(u8),

    #[error("entity number {0} out of range")]
    EntityNumberOutOfRange(u32),

    #[error("invalid area mask size {0}")]
    AreaMaskSize(usize),

    #[error("configstring index {0} out of range")]
    ConfigStringIndex(usize),

    #[error("gamestate exceeds {0} characters")]
    GamestateOverflow(usize),

    #[error("string exceeds {0} characters")]
    StringTooLong(usize),

    /// Too many client commands waiting for acknowledgement.
    #[error("reliable command queue exhausted ({pending} pending)")]
    ReliableOverflow { pending: u32 },

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u32),

    #[error("handshake failed: {0}")]
    BadHandshake(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Shorthand for building a [`NetError::MalformedDelta`].
    pub fn malformed(table: &'static str, reason: impl Into<String>) -> Self {
        NetError::MalformedDelta {
            table,
            reason: reason.into(),
        }
    }
}
