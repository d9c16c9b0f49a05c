//! Per-hop session keys and the onion layer cipher.
//!
//! Each layer is AES-128 in ECB mode keyed with a 16-byte session key. The
//! transform must be length-preserving because encrypted bodies carry no IV
//! or tag on the wire:
//!
//! - whole blocks are encrypted independently;
//! - a trailing partial block is handled with ciphertext stealing;
//! - bodies shorter than one block are XORed with `AES_k(0^128)`.
//!
//! ECB leaks equality of plaintext blocks. That is a property of the tunnel
//! protocol, not of this implementation.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::Zeroize;

use crate::hash::{self, SHA1_SIZE};
use crate::{CryptoError, Result};

/// Session key length (AES-128).
pub const KEY_SIZE: usize = 16;

/// AES block length.
pub const BLOCK_SIZE: usize = 16;

/// A symmetric key shared between the originator and one hop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Derive a key from DH secret bytes: `SHA-1(secret)[..16]`.
    pub fn derive(secret: &[u8]) -> Self {
        let digest = hash::sha1(secret);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest[..KEY_SIZE]);
        Self { bytes }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Create from a slice, checking its length.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = data.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: data.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// SHA-1 of the key, sent in CREATED so the originator can verify it
    /// derived the same key.
    pub fn hashed(&self) -> [u8; SHA1_SIZE] {
        hash::sha1(&self.bytes)
    }

    /// Check a hashed key received in CREATED/EXTENDED against this key.
    pub fn verify_hash(&self, hashed: &[u8]) -> Result<()> {
        if hashed == self.hashed() {
            Ok(())
        } else {
            Err(CryptoError::KeyMismatch)
        }
    }

    /// Add one layer in place.
    pub fn encrypt(&self, data: &mut [u8]) {
        LayerCipher::new(self).encrypt(data);
    }

    /// Remove one layer in place.
    pub fn decrypt(&self, data: &mut [u8]) {
        LayerCipher::new(self).decrypt(data);
    }

    /// Add one layer, returning a new buffer.
    pub fn encrypt_to_vec(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.encrypt(&mut out);
        out
    }

    /// Remove one layer, returning a new buffer.
    pub fn decrypt_to_vec(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.decrypt(&mut out);
        out
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

struct LayerCipher {
    aes: Aes128,
}

impl LayerCipher {
    fn new(key: &SessionKey) -> Self {
        Self {
            aes: Aes128::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        self.aes.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        self.aes.decrypt_block(GenericArray::from_mut_slice(block));
    }

    fn xor_keystream(&self, data: &mut [u8]) {
        let mut pad = [0u8; BLOCK_SIZE];
        self.encrypt_block(&mut pad);
        for (byte, k) in data.iter_mut().zip(pad.iter()) {
            *byte ^= k;
        }
    }

    fn encrypt(&self, data: &mut [u8]) {
        let len = data.len();
        if len < BLOCK_SIZE {
            self.xor_keystream(data);
            return;
        }
        let full = len / BLOCK_SIZE;
        let rem = len % BLOCK_SIZE;
        for block in data[..full * BLOCK_SIZE].chunks_exact_mut(BLOCK_SIZE) {
            self.encrypt_block(block);
        }
        if rem == 0 {
            return;
        }

        // Ciphertext stealing: the tail of E(P[n-1]) pads the partial block.
        let last = (full - 1) * BLOCK_SIZE;
        let mut stolen = [0u8; BLOCK_SIZE];
        stolen.copy_from_slice(&data[last..last + BLOCK_SIZE]);

        let mut merged = [0u8; BLOCK_SIZE];
        merged[..rem].copy_from_slice(&data[full * BLOCK_SIZE..]);
        merged[rem..].copy_from_slice(&stolen[rem..]);
        self.encrypt_block(&mut merged);

        data[last..last + BLOCK_SIZE].copy_from_slice(&merged);
        data[full * BLOCK_SIZE..].copy_from_slice(&stolen[..rem]);
    }

    fn decrypt(&self, data: &mut [u8]) {
        let len = data.len();
        if len < BLOCK_SIZE {
            self.xor_keystream(data);
            return;
        }
        let full = len / BLOCK_SIZE;
        let rem = len % BLOCK_SIZE;
        if rem == 0 {
            for block in data.chunks_exact_mut(BLOCK_SIZE) {
                self.decrypt_block(block);
            }
            return;
        }

        let last = (full - 1) * BLOCK_SIZE;
        for block in data[..last].chunks_exact_mut(BLOCK_SIZE) {
            self.decrypt_block(block);
        }

        let mut merged = [0u8; BLOCK_SIZE];
        merged.copy_from_slice(&data[last..last + BLOCK_SIZE]);
        self.decrypt_block(&mut merged);

        let mut stolen = [0u8; BLOCK_SIZE];
        stolen[..rem].copy_from_slice(&data[full * BLOCK_SIZE..]);
        stolen[rem..].copy_from_slice(&merged[rem..]);
        self.decrypt_block(&mut stolen);

        data[last..last + BLOCK_SIZE].copy_from_slice(&stolen);
        data[full * BLOCK_SIZE..].copy_from_slice(&merged[..rem]);
    }
}
