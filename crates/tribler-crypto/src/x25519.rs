//! X25519 long-term peer keys (RFC 7748).
//!
//! Every peer in the overlay owns one static keypair. The public half travels
//! in candidate lists and bootstrap configuration; the secret half is only used
//! to unwrap CREATE key material addressed to this peer.

use std::fmt;

use rand::rngs::OsRng;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Length of an encoded X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 static secret key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; PUBLIC_KEY_SIZE],
}

/// An X25519 shared secret.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl X25519StaticSecret {
    /// Generate a new random static secret from the OS RNG.
    pub fn random() -> Self {
        Self::random_from_rng(OsRng)
    }

    /// Generate a new static secret from a caller-supplied RNG.
    pub fn random_from_rng<R: RngCore + CryptoRng>(rng: R) -> Self {
        Self {
            inner: StaticSecret::random_from_rng(rng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Parse a hex-encoded secret (as stored in the identity file).
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: v.len(),
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Hex-encode the secret.
    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.to_bytes())
    }

    /// Get the raw bytes of this secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        let pk = PublicKey::from(&self.inner);
        X25519PublicKey {
            bytes: pk.to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let pk = PublicKey::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&pk);
        SharedSecret {
            bytes: *shared.as_bytes(),
        }
    }
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Create from a slice, checking its length.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            data.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: data.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded public key (as written in bootstrap configuration).
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        Self::from_slice(&raw)
    }

    /// Hex-encode the public key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Get the raw bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.bytes
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex digits are enough to tell peers apart in logs.
        write!(f, "X25519PublicKey({})", &self.to_hex()[..8])
    }
}

impl SharedSecret {
    /// Get the raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Compute X25519 basepoint multiplication (public key from secret).
pub fn basepoint_mult(secret: &[u8; 32]) -> [u8; 32] {
    let sk = StaticSecret::from(*secret);
    let pk = PublicKey::from(&sk);
    pk.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_diffie_hellman_agreement() {
        let alice_secret = X25519StaticSecret::random();
        let bob_secret = X25519StaticSecret::random();

        let alice_shared = alice_secret.diffie_hellman(&bob_secret.public_key());
        let bob_shared = bob_secret.diffie_hellman(&alice_secret.public_key());

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let a = X25519StaticSecret::random_from_rng(StdRng::seed_from_u64(7));
        let b = X25519StaticSecret::random_from_rng(StdRng::seed_from_u64(7));
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_hex_roundtrip() {
        let secret = X25519StaticSecret::random();
        let restored = X25519StaticSecret::from_hex(&secret.to_hex()).expect("parse secret");
        assert_eq!(secret.public_key(), restored.public_key());

        let pk = secret.public_key();
        let parsed = X25519PublicKey::from_hex(&pk.to_hex()).expect("parse public");
        assert_eq!(pk, parsed);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let result = X25519PublicKey::from_slice(&[0u8; 31]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn test_basepoint_mult() {
        let secret = X25519StaticSecret::random();
        assert_eq!(
            secret.public_key().to_bytes(),
            basepoint_mult(&secret.to_bytes())
        );
    }

    #[test]
    fn test_rfc7748_section6_1() {
        let alice_private: [u8; 32] =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .expect("valid hex")
                .try_into()
                .expect("32 bytes");
        let alice_public =
            hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                .expect("valid hex");
        assert_eq!(basepoint_mult(&alice_private).to_vec(), alice_public);
    }
}
