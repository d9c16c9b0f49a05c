//! Candidate list returned in CREATED/EXTENDED.
//!
//! Plaintext layout, encrypted under the session key of the replying hop:
//!
//! ```text
//! count u32
//! ( host-len u32 ‖ port u32 ‖ host ‖ public-key[32] ) * count
//! ```

use std::net::SocketAddr;

use tribler_crypto::x25519::{X25519PublicKey, PUBLIC_KEY_SIZE};

use crate::address::HostPort;
use crate::reader::Reader;
use crate::{Result, WireError};

/// Most candidates a hop advertises.
pub const MAX_CANDIDATES: usize = 4;

/// A potential next hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CandidateEntry {
    pub address: SocketAddr,
    pub public_key: X25519PublicKey,
}

/// Encode up to [`MAX_CANDIDATES`] entries; extra entries are ignored.
pub fn encode(entries: &[CandidateEntry]) -> Vec<u8> {
    let entries = &entries[..entries.len().min(MAX_CANDIDATES)];
    let mut out = Vec::with_capacity(4 + entries.len() * 64);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        let host = entry.address.ip().to_string();
        out.extend_from_slice(&(host.len() as u32).to_be_bytes());
        out.extend_from_slice(&u32::from(entry.address.port()).to_be_bytes());
        out.extend_from_slice(host.as_bytes());
        out.extend_from_slice(entry.public_key.as_bytes());
    }
    out
}

/// Decode a candidate list. Hosts must be IP literals.
pub fn decode(data: &[u8]) -> Result<Vec<CandidateEntry>> {
    let mut r = Reader::new(data);
    let count = r.u32()? as usize;
    if count > MAX_CANDIDATES {
        return Err(WireError::Inconsistent(format!(
            "{count} candidates exceeds limit {MAX_CANDIDATES}"
        )));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let host_len = r.u32()? as usize;
        let port = r.u32()?;
        let hp = HostPort::from_wire(r.bytes(host_len)?, port)?;
        let address = hp.to_socket_addr().ok_or_else(|| {
            WireError::Inconsistent(format!("candidate host {} is not an IP", hp.host))
        })?;
        let public_key = X25519PublicKey::from_slice(r.bytes(PUBLIC_KEY_SIZE)?)
            .map_err(|e| WireError::Inconsistent(e.to_string()))?;
        entries.push(CandidateEntry {
            address,
            public_key,
        });
    }
    r.finish()?;
    Ok(entries)
}
