//! # tribler-crypto
//!
//! Cryptographic primitives for the anonymous tunnel overlay.
//!
//! The suite is fixed; peers do not negotiate algorithms.
//!
//! ## Modules
//!
//! - [`x25519`]: Long-term peer keypairs (RFC 7748)
//! - [`ecies`]: Asymmetric wrap/unwrap of CREATE key material
//! - [`dh`]: 2048-bit MODP Diffie-Hellman (RFC 3526 group 14)
//! - [`layer`]: Per-hop session keys and the length-preserving layer cipher
//! - [`hash`]: SHA-1 and BLAKE3 helpers

pub mod dh;
pub mod ecies;
pub mod hash;
pub mod layer;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// ECIES wrap/unwrap failed.
    #[error("ECIES error: {0}")]
    Ecies(String),

    /// A Diffie-Hellman share was out of range or malformed.
    #[error("invalid DH share: {0}")]
    InvalidShare(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// The hashed key in a CREATED/EXTENDED body did not match ours.
    #[error("session key hash mismatch")]
    KeyMismatch,

    /// Invalid input data (bad hex, wrong size).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeyLength {
            expected: 16,
            actual: 3,
        };
        assert_eq!(err.to_string(), "invalid key length: expected 16, got 3");
        assert_eq!(CryptoError::KeyMismatch.to_string(), "session key hash mismatch");
    }
}
