//! # tribler-wire
//!
//! Wire codec for the anonymous tunnel overlay.
//!
//! ## Architecture
//!
//! ```text
//! overlay datagram
//!     |
//!     v
//! bypass tag (frame.rs)      -- fixed prefix routing the datagram to the tunnel
//!     |
//!     v
//! header (frame.rs)          -- circuit-id (u32 BE) || type (u8) || body
//!     |
//!     v
//! TunnelMessage (message.rs) -- typed body per message type
//!     |
//!     +-- candidate lists (candidates.rs), inside CREATED/EXTENDED
//!     +-- stats payloads (stats.rs), CBOR inside STATS
//! ```
//!
//! All integers are big-endian. Bodies may be encrypted between the header
//! and the typed decoder; the codec itself never touches keys.

pub mod address;
pub mod candidates;
pub mod frame;
pub mod message;
pub mod stats;

mod reader;

/// Error types for wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Input ended before a field could be read.
    #[error("truncated input: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// The header carries a type byte we do not know.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// Length fields disagree with the body, or a field is out of range.
    #[error("inconsistent frame: {0}")]
    Inconsistent(String),

    /// The datagram does not start with our bypass tag.
    #[error("missing bypass tag")]
    MissingBypassTag,

    /// CBOR serialization of a stats payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization of a stats payload failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl WireError {
    /// Whether the error is a malformed-frame error, as opposed to an
    /// unknown-but-well-formed type.
    pub fn is_decode_error(&self) -> bool {
        !matches!(self, Self::UnknownType(_))
    }
}

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

pub use address::HostPort;
pub use candidates::CandidateEntry;
pub use frame::{BypassTag, RawFrame, ZERO_HOP_CIRCUIT};
pub use message::{KeyReply, MessageType, TunnelMessage};
pub use stats::{StatsPayload, StatsReport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WireError::Truncated {
            offset: 4,
            needed: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "truncated input: needed 4 bytes at offset 4, have 1"
        );
    }

    #[test]
    fn test_unknown_type_is_not_a_decode_error() {
        assert!(!WireError::UnknownType(42).is_decode_error());
        assert!(WireError::Inconsistent("x".into()).is_decode_error());
    }
}
