//! UDP request header (RFC 1928 §7).
//!
//! ```text
//! RSV (2) | FRAG (1) | ATYP | DST.ADDR | DST.PORT | DATA
//! ```

use tribler_wire::HostPort;

use crate::codec::{decode_address, encode_address};
use crate::{Result, SocksError};

const HEADER_PREFIX: usize = 3;

/// Split a client datagram into destination and payload.
pub fn decode(datagram: &[u8]) -> Result<(HostPort, &[u8])> {
    if datagram.len() < HEADER_PREFIX {
        return Err(SocksError::Truncated {
            needed: HEADER_PREFIX,
            available: datagram.len(),
        });
    }
    let frag = datagram[2];
    if frag != 0 {
        return Err(SocksError::Fragmented(frag));
    }
    let (destination, used) = decode_address(&datagram[HEADER_PREFIX..])?;
    Ok((destination, &datagram[HEADER_PREFIX + used..]))
}

/// Prefix `payload` with a header naming `origin`.
pub fn encode(origin: &HostPort, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_PREFIX + 1 + 16 + 2 + payload.len());
    out.extend_from_slice(&[0, 0, 0]);
    encode_address(&mut out, origin);
    out.extend_from_slice(payload);
    out
}
