//! Finite-field Diffie-Hellman over the 2048-bit MODP group (RFC 3526, group 14).
//!
//! Key exchange at hop `i`:
//!
//! 1. The originator picks `a`, sends `g^a mod p` wrapped under the hop's
//!    long-term key.
//! 2. The hop picks `b`, computes `S = (g^a)^b mod p` and returns `g^b mod p`
//!    together with the SHA-1 of the derived session key.
//! 3. The originator computes `S = (g^b)^a mod p` and derives the same key.
//!
//! Shares and secrets are encoded big-endian, left-padded to [`SHARE_SIZE`].

use std::sync::OnceLock;

use num_bigint::BigUint;
use rand_core::{CryptoRng, RngCore};

use crate::layer::SessionKey;
use crate::{CryptoError, Result};

/// Size of an encoded group element (2048 bits).
pub const SHARE_SIZE: usize = 256;

/// Group generator.
pub const GENERATOR: u32 = 2;

/// RFC 3526 group 14 prime.
const MODULUS_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

fn modulus() -> &'static BigUint {
    static MODULUS: OnceLock<BigUint> = OnceLock::new();
    MODULUS.get_or_init(|| {
        BigUint::parse_bytes(MODULUS_HEX.as_bytes(), 16).expect("RFC 3526 prime is valid hex")
    })
}

fn encode(value: &BigUint) -> [u8; SHARE_SIZE] {
    let raw = value.to_bytes_be();
    let mut out = [0u8; SHARE_SIZE];
    let start = SHARE_SIZE.saturating_sub(raw.len());
    out[start..].copy_from_slice(&raw[raw.len().saturating_sub(SHARE_SIZE)..]);
    out
}

/// A public DH share `g^x mod p`.
#[derive(Clone, PartialEq, Eq)]
pub struct DhShare {
    bytes: [u8; SHARE_SIZE],
}

impl DhShare {
    /// Parse a share received from the wire.
    ///
    /// Rejects anything outside `[2, p - 2]`, which excludes the degenerate
    /// elements that would force a predictable shared secret.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() > SHARE_SIZE {
            return Err(CryptoError::InvalidShare(format!(
                "share length {} not in 1..={SHARE_SIZE}",
                data.len()
            )));
        }
        let value = BigUint::from_bytes_be(data);
        let p = modulus();
        let two = BigUint::from(2u32);
        if value < two || value > p - &two {
            return Err(CryptoError::InvalidShare("share out of range".into()));
        }
        Ok(Self {
            bytes: encode(&value),
        })
    }

    /// Encoded big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; SHARE_SIZE] {
        &self.bytes
    }

    fn value(&self) -> BigUint {
        BigUint::from_bytes_be(&self.bytes)
    }
}

impl std::fmt::Debug for DhShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhShare({}…)", hex::encode(&self.bytes[..4]))
    }
}

/// A private DH exponent.
pub struct DhSecret {
    exponent: BigUint,
}

impl DhSecret {
    /// Draw a secret uniformly from `[0, p)`.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let p = modulus();
        loop {
            let mut raw = [0u8; SHARE_SIZE];
            rng.fill_bytes(&mut raw);
            let candidate = BigUint::from_bytes_be(&raw);
            // Rejection sampling; p is within 2^-64 of 2^2048 so this almost
            // never loops.
            if &candidate < p {
                return Self {
                    exponent: candidate,
                };
            }
        }
    }

    /// Compute the public share `g^x mod p`.
    pub fn public_share(&self) -> DhShare {
        let g = BigUint::from(GENERATOR);
        DhShare {
            bytes: encode(&g.modpow(&self.exponent, modulus())),
        }
    }

    /// Compute the shared secret with the peer's share.
    pub fn agree(&self, peer: &DhShare) -> DhSharedSecret {
        DhSharedSecret {
            bytes: encode(&peer.value().modpow(&self.exponent, modulus())),
        }
    }
}

/// The agreed group element `S`.
pub struct DhSharedSecret {
    bytes: [u8; SHARE_SIZE],
}

impl DhSharedSecret {
    /// Derive the 16-byte per-hop session key: the first 16 bytes of SHA-1(S).
    pub fn session_key(&self) -> SessionKey {
        SessionKey::derive(&self.bytes)
    }
}

impl Drop for DhSharedSecret {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.bytes);
    }
}
