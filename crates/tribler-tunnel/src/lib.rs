//! # tribler-tunnel
//!
//! Anonymous tunnel engine: layered-encryption circuits over an unreliable
//! datagram overlay.
//!
//! - [`engine`] - Dispatcher, circuit state machine, relaying and exit handling
//! - [`circuit`] - Originator-side circuits and hops
//! - [`relay`] - Intermediate-side relay routes and direction tags
//! - [`tables`] - The circuit/relay/destination bundle behind one mutex
//! - [`onion`] - Which key layers a body in which direction
//! - [`request_cache`] - Deadlines for CREATE/EXTEND, PING and half-open relays
//! - [`strategy`] - Length, selection and extend strategies
//! - [`exit`] - Exit socket table
//! - [`stats`] - Byte-counter sampling and peer stats reports
//! - [`pool`] - Circuit reservations for client sessions
//! - [`runtime`] - Tokio event loop driving the engine
//! - [`memory`] - In-memory overlay for deterministic tests
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | CREATE/EXTEND/PING timeout | 5 s |
//! | Keepalive interval | 10 s |
//! | Circuit idle timeout | 20 s (PING once less than 10 s remain) |
//! | Relay idle timeout | walk lifetime (60 s) + 5 s |
//! | Candidates per CREATED | 4 |
//! | Circuit ids | random in `[1, 2^32)`, 0 is the zero-hop circuit |

pub mod circuit;
pub mod engine;
pub mod exit;
pub mod memory;
pub mod observer;
pub mod onion;
pub mod overlay;
pub mod peer;
pub mod pool;
pub mod relay;
pub mod request_cache;
pub mod runtime;
pub mod settings;
pub mod stats;
pub mod strategy;
pub mod tables;

use std::time::Duration;

/// CREATE, EXTEND and PING deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the keepalive task.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A circuit without incoming traffic for this long is considered dead.
pub const CIRCUIT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Candidate walk lifetime of the overlay substrate.
pub const CANDIDATE_WALK_LIFETIME: Duration = Duration::from_secs(60);

/// Slack added to the walk lifetime before idle relays are dropped.
pub const RELAY_IDLE_SLACK: Duration = Duration::from_secs(5);

/// Stats sampling interval.
pub const STATS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Circuit-id rerolls before giving up.
pub const MAX_ID_REROLLS: usize = 32;

/// Error types for tunnel operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Malformed frame.
    #[error("decode error: {0}")]
    Decode(#[from] tribler_wire::WireError),

    /// Unwrap failure or hashed-key mismatch.
    #[error("crypto error: {0}")]
    Crypto(#[from] tribler_crypto::CryptoError),

    /// A CREATE, EXTEND or PING deadline passed.
    #[error("request timed out")]
    Timeout,

    /// Not enough READY circuits to serve a session.
    #[error("not enough circuits: wanted {wanted}, have {available}")]
    NotEnoughCircuits { wanted: usize, available: usize },

    /// No free circuit id after repeated rerolls.
    #[error("no free circuit id after {0} attempts")]
    Capacity(usize),

    /// No circuit with this id.
    #[error("unknown circuit {0}")]
    UnknownCircuit(u32),

    /// The circuit exists but is still extending.
    #[error("circuit {0} is not ready")]
    CircuitNotReady(u32),

    /// No verified candidate can serve as the next hop.
    #[error("no candidates available")]
    NoCandidates,

    /// A zero-hop circuit was requested but clear-text exit is disabled.
    #[error("zero-hop circuits are disabled")]
    ZeroHopDisabled,

    /// The engine loop is gone.
    #[error("tunnel runtime stopped")]
    Stopped,

    /// Socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

pub use circuit::CircuitState;
pub use engine::{EngineIo, TunnelCounters, TunnelEngine};
pub use observer::{TunnelEvent, TunnelObserver};
pub use peer::{LinkKey, Peer};
pub use runtime::{TunnelDatagram, TunnelHandle, TunnelRuntime, TunnelSession};
pub use settings::TunnelSettings;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(REQUEST_TIMEOUT.as_secs(), 5);
        assert_eq!(KEEPALIVE_INTERVAL.as_secs(), 10);
        assert!(CIRCUIT_IDLE_TIMEOUT > KEEPALIVE_INTERVAL);
        assert_eq!((CANDIDATE_WALK_LIFETIME + RELAY_IDLE_SLACK).as_secs(), 65);
    }

    #[test]
    fn test_error_display() {
        let err = TunnelError::NotEnoughCircuits {
            wanted: 4,
            available: 1,
        };
        assert!(err.to_string().contains("wanted 4"));
        assert_eq!(
            TunnelError::UnknownCircuit(7).to_string(),
            "unknown circuit 7"
        );
    }
}
