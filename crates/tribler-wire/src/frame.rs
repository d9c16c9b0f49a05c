//! Frame header and bypass tag.
//!
//! ## Wire format
//!
//! ```text
//! bypass-tag (overlay-chosen, default ff ff ff fe)
//! circuit-id  u32 BE
//! type        u8
//! body        (possibly encrypted)
//! ```

use crate::reader::Reader;
use crate::{Result, WireError};

/// Default bypass tag.
pub const DEFAULT_BYPASS_TAG: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFE];

/// Size of the header that follows the bypass tag.
pub const HEADER_SIZE: usize = 5;

/// Reserved circuit id of the zero-hop pseudo-circuit.
pub const ZERO_HOP_CIRCUIT: u32 = 0;

/// Prefix that marks an overlay datagram as tunnel traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BypassTag {
    bytes: Vec<u8>,
}

impl BypassTag {
    /// Create a tag from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw tag bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Strip the tag, returning the framed bytes.
    pub fn strip<'a>(&self, datagram: &'a [u8]) -> Result<&'a [u8]> {
        datagram
            .strip_prefix(self.bytes.as_slice())
            .ok_or(WireError::MissingBypassTag)
    }

    /// Prepend the tag to framed bytes.
    pub fn wrap(&self, frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len() + frame.len());
        out.extend_from_slice(&self.bytes);
        out.extend_from_slice(frame);
        out
    }
}

impl Default for BypassTag {
    fn default() -> Self {
        Self::new(DEFAULT_BYPASS_TAG.to_vec())
    }
}

/// A decoded header with the body left opaque.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame<'a> {
    /// Circuit id, scoped to the (peer, direction) link.
    pub circuit_id: u32,
    /// Message type byte, not yet validated.
    pub type_byte: u8,
    /// Body bytes (possibly encrypted).
    pub body: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// Decode the header of framed bytes (bypass tag already stripped).
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let circuit_id = r.u32()?;
        let type_byte = r.u8()?;
        Ok(Self {
            circuit_id,
            type_byte,
            body: r.rest(),
        })
    }
}

/// Encode a header and body.
pub fn encode(circuit_id: u32, type_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&circuit_id.to_be_bytes());
    out.push(type_byte);
    out.extend_from_slice(body);
    out
}
