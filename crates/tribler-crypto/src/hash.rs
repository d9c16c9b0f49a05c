//! Hash helpers.
//!
//! SHA-1 is used where the tunnel protocol fixes it: deriving per-hop session
//! keys from DH secrets and hashing session keys for CREATED verification.
//! BLAKE3 in key-derivation mode backs the ECIES wrap.

use sha1::{Digest, Sha1};

/// SHA-1 digest length.
pub const SHA1_SIZE: usize = 20;

/// Context strings for BLAKE3 key derivation.
pub mod contexts {
    pub const ECIES_ENCRYPTION_KEY: &str = "Tribler tunnel v1 ecies-encryption-key";
    pub const ECIES_NONCE: &str = "Tribler tunnel v1 ecies-nonce";
}

/// Compute the SHA-1 digest of `data`.
pub fn sha1(data: &[u8]) -> [u8; SHA1_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let mut digest = [0u8; SHA1_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Derive a 32-byte key using BLAKE3's key derivation mode.
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        // FIPS 180-1 appendix A.
        assert_eq!(
            hex::encode(sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_derive_key_domain_separated() {
        let material = [0x42u8; 32];
        let k1 = derive_key(contexts::ECIES_ENCRYPTION_KEY, &material);
        let k2 = derive_key(contexts::ECIES_NONCE, &material);
        assert_ne!(k1, k2);
        assert_eq!(k1, derive_key(contexts::ECIES_ENCRYPTION_KEY, &material));
    }
}
