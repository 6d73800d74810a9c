//! # Error Types
//!
//! Error handling for the packet substrate, the object pool and the
//! connection managers.
//!
//! ## Error Categories
//! - **Encoding Errors**: capacity, underrun and oversized values. Local to a
//!   single buffer operation; the caller aborts that one message.
//! - **Pool Errors**: ownership violations and exhaustion. Reported loudly,
//!   never fatal to the process.
//! - **Connection Errors**: malformed frames, unknown opcodes and transport
//!   failures. Isolated to one connection.
//! - **Configuration Errors**: invalid or unreadable configuration.
//!
//! ## Example Usage
//! ```rust
//! use tickwire::core::bitbuf::{BitBuffer, BitWrite, BufferMode};
//! use tickwire::error::{ProtocolError, Result};
//!
//! fn fill(buffer: &mut BitBuffer) -> Result<()> {
//!     buffer.write_u32(7)?;
//!     buffer.write_u32(8)?;
//!     Ok(())
//! }
//!
//! let mut buffer = BitBuffer::with_capacity(4, BufferMode::Static);
//! assert!(matches!(
//!     fill(&mut buffer),
//!     Err(ProtocolError::CapacityExceeded { .. })
//! ));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Pool errors
    pub const ERR_POOL_LOCK_POISONED: &str = "Pool lock poisoned";

    /// Framing errors
    pub const ERR_LENGTH_BELOW_HEADER: &str = "Frame length shorter than frame header";
    pub const ERR_LENGTH_ABOVE_LIMIT: &str = "Frame length exceeds configured maximum";

    /// Connection errors
    pub const ERR_PEER_CLOSED: &str = "Peer closed the stream";
    pub const ERR_ALREADY_CONNECTED: &str = "Client already has a live connection";
}

// ProtocolError is the primary error type for all operations in this crate
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Capacity exceeded: {requested_bits} bits requested, capacity is {capacity_bits} bits")]
    CapacityExceeded {
        requested_bits: usize,
        capacity_bits: usize,
    },

    #[error("Buffer underrun: {requested_bits} bits requested, {available_bits} available")]
    BufferUnderrun {
        requested_bits: usize,
        available_bits: usize,
    },

    #[error("Value too large: {len} (maximum {max})")]
    ValueTooLarge { len: usize, max: usize },

    #[error("Invalid bit count: {0} (valid range 0-64)")]
    InvalidBitCount(u32),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Object is not checked out from this pool")]
    NotOwned,

    #[error("Pool exhausted: all {0} slots are checked out")]
    PoolExhausted(usize),

    #[error("Pool slot {index} checked out for {held_ms}ms without release")]
    PoolExhaustionSuspected { index: usize, held_ms: u128 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u32),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full: {queued} bytes queued, limit {limit}")]
    Backpressure { queued: usize, limit: usize },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// True for errors raised while encoding or decoding a single field.
    ///
    /// These never escape the message being assembled or read.
    pub fn is_encoding_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::CapacityExceeded { .. }
                | ProtocolError::BufferUnderrun { .. }
                | ProtocolError::ValueTooLarge { .. }
                | ProtocolError::InvalidBitCount(_)
                | ProtocolError::DeserializeError(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_error_classification() {
        assert!(ProtocolError::ValueTooLarge { len: 70_000, max: 65_535 }.is_encoding_error());
        assert!(ProtocolError::BufferUnderrun {
            requested_bits: 8,
            available_bits: 0
        }
        .is_encoding_error());
        assert!(!ProtocolError::NotOwned.is_encoding_error());
        assert!(!ProtocolError::MalformedFrame("x".into()).is_encoding_error());
    }

    #[test]
    fn test_io_conversion() {
        let err: ProtocolError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ProtocolError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
