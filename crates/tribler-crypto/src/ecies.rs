//! ECIES-X25519-ChaCha20-BLAKE3 wrap for CREATE key material.
//!
//! The originator's DH share for hop `i` is wrapped under hop `i`'s long-term
//! X25519 key so that only that hop can complete the key exchange.
//!
//! ## Algorithm
//!
//! ```text
//! wrap(recipient_pk, plaintext):
//!   1. eph_sk  = random
//!   2. eph_pk  = X25519_basepoint_mult(eph_sk)
//!   3. shared  = X25519(eph_sk, recipient_pk)
//!   4. enc_key = BLAKE3::derive_key("… ecies-encryption-key", shared || eph_pk || recipient_pk)
//!   5. nonce   = BLAKE3::derive_key("… ecies-nonce", shared || eph_pk)[:12]
//!   6. return eph_pk || ChaCha20-Poly1305(enc_key, nonce, plaintext, aad = eph_pk)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{CryptoRng, RngCore};

use crate::hash::{self, contexts};
use crate::x25519::{self, X25519PublicKey, X25519StaticSecret, PUBLIC_KEY_SIZE};
use crate::{CryptoError, Result};

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Bytes added by [`wrap`] on top of the plaintext.
pub const OVERHEAD: usize = PUBLIC_KEY_SIZE + TAG_SIZE;

struct WrapKeys {
    enc_key: [u8; 32],
    nonce: [u8; 12],
}

fn derive_wrap_keys(shared: &[u8; 32], eph_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> WrapKeys {
    let mut key_material = Vec::with_capacity(96);
    key_material.extend_from_slice(shared);
    key_material.extend_from_slice(eph_pk);
    key_material.extend_from_slice(recipient_pk);
    let enc_key = hash::derive_key(contexts::ECIES_ENCRYPTION_KEY, &key_material);

    let nonce_full = hash::derive_key(contexts::ECIES_NONCE, &key_material[..64]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_full[..12]);

    WrapKeys { enc_key, nonce }
}

/// Wrap `plaintext` under `recipient_pk`.
///
/// Output layout: `eph_pk (32) || ciphertext || tag (16)`.
pub fn wrap<R: RngCore + CryptoRng>(
    rng: &mut R,
    recipient_pk: &X25519PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut randomness = [0u8; 32];
    rng.fill_bytes(&mut randomness);

    let eph_pk = x25519::basepoint_mult(&randomness);
    let eph_secret = X25519StaticSecret::from_bytes(randomness);
    let shared = eph_secret.diffie_hellman(recipient_pk);
    let keys = derive_wrap_keys(shared.as_bytes(), &eph_pk, recipient_pk.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.enc_key));
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&keys.nonce),
            Payload {
                msg: plaintext,
                aad: &eph_pk,
            },
        )
        .map_err(|_| CryptoError::Ecies("encryption failed".into()))?;

    let mut out = Vec::with_capacity(OVERHEAD + plaintext.len());
    out.extend_from_slice(&eph_pk);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Unwrap a blob produced by [`wrap`] with the recipient's static secret.
pub fn unwrap(recipient_sk: &X25519StaticSecret, wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < OVERHEAD {
        return Err(CryptoError::Ecies(format!(
            "ciphertext too short: {} bytes",
            wrapped.len()
        )));
    }
    let eph_pk = X25519PublicKey::from_slice(&wrapped[..PUBLIC_KEY_SIZE])?;
    let shared = recipient_sk.diffie_hellman(&eph_pk);
    let keys = derive_wrap_keys(
        shared.as_bytes(),
        eph_pk.as_bytes(),
        recipient_sk.public_key().as_bytes(),
    );

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.enc_key));
    cipher
        .decrypt(
            Nonce::from_slice(&keys.nonce),
            Payload {
                msg: &wrapped[PUBLIC_KEY_SIZE..],
                aad: eph_pk.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::AeadDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let sk = X25519StaticSecret::random();
        let wrapped = wrap(&mut OsRng, &sk.public_key(), b"dh share").expect("wrap");
        assert_eq!(wrapped.len(), b"dh share".len() + OVERHEAD);
        let plain = unwrap(&sk, &wrapped).expect("unwrap");
        assert_eq!(plain, b"dh share");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sk1 = X25519StaticSecret::random();
        let sk2 = X25519StaticSecret::random();
        let wrapped = wrap(&mut OsRng, &sk1.public_key(), b"test").expect("wrap");
        assert!(matches!(unwrap(&sk2, &wrapped), Err(CryptoError::AeadDecryption)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let sk = X25519StaticSecret::random();
        let mut wrapped = wrap(&mut OsRng, &sk.public_key(), b"test").expect("wrap");
        if let Some(byte) = wrapped.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(unwrap(&sk, &wrapped).is_err());
    }

    #[test]
    fn test_short_input_rejected() {
        let sk = X25519StaticSecret::random();
        assert!(matches!(
            unwrap(&sk, &[0u8; OVERHEAD - 1]),
            Err(CryptoError::Ecies(_))
        ));
    }
}
