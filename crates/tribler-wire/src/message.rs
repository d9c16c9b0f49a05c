//! Typed tunnel messages and their body codecs.
//!
//! ## Body layouts
//!
//! | Type | Body |
//! |------|------|
//! | CREATE (1) | `encrypted-key` |
//! | CREATED (2) | `dh-len u32 ‖ dh-share ‖ hashed-key[20] ‖ candidate-cipher` |
//! | EXTEND (3) | `host-len u32 ‖ port u32 ‖ host ‖ encrypted-key` |
//! | EXTENDED (4) | same as CREATED |
//! | DATA (5) | `dst-host-len ‖ dst-port ‖ orig-host-len ‖ orig-port ‖ payload-len ‖ dst-host ‖ orig-host ‖ payload` |
//! | PING (7), PONG (8) | empty |
//! | PUNCTURE (9) | `host-len u32 ‖ port u32 ‖ host` |
//! | STATS (10) | `len u32 ‖ CBOR(StatsPayload)` |
//!
//! Every length field is checked against the body; trailing bytes are an
//! error.

use tribler_crypto::hash::SHA1_SIZE;

use crate::address::HostPort;
use crate::reader::Reader;
use crate::stats::StatsPayload;
use crate::{frame, Result, WireError};

/// Message type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Create = 1,
    Created = 2,
    Extend = 3,
    Extended = 4,
    Data = 5,
    Ping = 7,
    Pong = 8,
    Puncture = 9,
    Stats = 10,
}

impl MessageType {
    /// Parse a type byte.
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => Self::Create,
            2 => Self::Created,
            3 => Self::Extend,
            4 => Self::Extended,
            5 => Self::Data,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::Puncture,
            10 => Self::Stats,
            other => return Err(WireError::UnknownType(other)),
        })
    }

    /// The type byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// CREATE and CREATED travel a single link and are never layered.
    pub fn is_link_local(self) -> bool {
        matches!(self, Self::Create | Self::Created)
    }
}

/// DH reply carried by CREATED and EXTENDED.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyReply {
    /// Responder's DH public share, big-endian.
    pub dh_share: Vec<u8>,
    /// SHA-1 of the derived session key.
    pub hashed_key: [u8; SHA1_SIZE],
    /// Candidate list encrypted under the session key.
    pub candidates: Vec<u8>,
}

/// A decoded tunnel message.
#[derive(Clone, Debug, PartialEq)]
pub enum TunnelMessage {
    Create {
        encrypted_key: Vec<u8>,
    },
    Created(KeyReply),
    Extend {
        /// `None` delegates the choice of next hop to the receiver.
        target: Option<HostPort>,
        encrypted_key: Vec<u8>,
    },
    Extended(KeyReply),
    Data {
        /// `None` means "deliver to the originator".
        destination: Option<HostPort>,
        origin: Option<HostPort>,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
    Puncture {
        target: HostPort,
    },
    Stats(StatsPayload),
}

impl TunnelMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Create { .. } => MessageType::Create,
            Self::Created(_) => MessageType::Created,
            Self::Extend { .. } => MessageType::Extend,
            Self::Extended(_) => MessageType::Extended,
            Self::Data { .. } => MessageType::Data,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Puncture { .. } => MessageType::Puncture,
            Self::Stats(_) => MessageType::Stats,
        }
    }

    /// Encode the body (without header).
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::Create { encrypted_key } => out.extend_from_slice(encrypted_key),
            Self::Created(reply) | Self::Extended(reply) => encode_key_reply(&mut out, reply),
            Self::Extend {
                target,
                encrypted_key,
            } => {
                let (host, port) = match target {
                    Some(hp) => (hp.host.as_bytes(), hp.port),
                    None => (&[][..], 0),
                };
                put_len(&mut out, host.len());
                put_u32(&mut out, u32::from(port));
                out.extend_from_slice(host);
                out.extend_from_slice(encrypted_key);
            }
            Self::Data {
                destination,
                origin,
                payload,
            } => {
                let dst = destination.clone().unwrap_or_else(HostPort::unspecified);
                let orig = origin.clone().unwrap_or_else(HostPort::unspecified);
                put_len(&mut out, dst.host.len());
                put_u32(&mut out, u32::from(dst.port));
                put_len(&mut out, orig.host.len());
                put_u32(&mut out, u32::from(orig.port));
                put_len(&mut out, payload.len());
                out.extend_from_slice(dst.host.as_bytes());
                out.extend_from_slice(orig.host.as_bytes());
                out.extend_from_slice(payload);
            }
            Self::Ping | Self::Pong => {}
            Self::Puncture { target } => {
                put_len(&mut out, target.host.len());
                put_u32(&mut out, u32::from(target.port));
                out.extend_from_slice(target.host.as_bytes());
            }
            Self::Stats(payload) => out = payload.encode()?,
        }
        Ok(out)
    }

    /// Decode a body of a known type.
    pub fn decode_body(message_type: MessageType, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let msg = match message_type {
            MessageType::Create => Self::Create {
                encrypted_key: r.rest().to_vec(),
            },
            MessageType::Created => Self::Created(decode_key_reply(&mut r)?),
            MessageType::Extended => Self::Extended(decode_key_reply(&mut r)?),
            MessageType::Extend => {
                let host_len = r.u32()? as usize;
                let port = r.u32()?;
                let host = r.bytes(host_len)?;
                Self::Extend {
                    target: HostPort::from_wire(host, port)?.into_option(),
                    encrypted_key: r.rest().to_vec(),
                }
            }
            MessageType::Data => {
                let dst_len = r.u32()? as usize;
                let dst_port = r.u32()?;
                let orig_len = r.u32()? as usize;
                let orig_port = r.u32()?;
                let payload_len = r.u32()? as usize;
                let declared = dst_len
                    .checked_add(orig_len)
                    .and_then(|n| n.checked_add(payload_len));
                if declared != Some(r.remaining()) {
                    return Err(WireError::Inconsistent(format!(
                        "DATA lengths {dst_len}+{orig_len}+{payload_len} != body {}",
                        r.remaining()
                    )));
                }
                let dst = HostPort::from_wire(r.bytes(dst_len)?, dst_port)?;
                let orig = HostPort::from_wire(r.bytes(orig_len)?, orig_port)?;
                Self::Data {
                    destination: dst.into_option(),
                    origin: orig.into_option(),
                    payload: r.bytes(payload_len)?.to_vec(),
                }
            }
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
            MessageType::Puncture => {
                let host_len = r.u32()? as usize;
                let port = r.u32()?;
                let host = r.bytes(host_len)?;
                Self::Puncture {
                    target: HostPort::from_wire(host, port)?,
                }
            }
            MessageType::Stats => Self::Stats(StatsPayload::decode(r.rest())?),
        };
        r.finish()?;
        Ok(msg)
    }

    /// Encode header and body.
    pub fn to_frame(&self, circuit_id: u32) -> Result<Vec<u8>> {
        Ok(frame::encode(
            circuit_id,
            self.message_type().as_u8(),
            &self.encode_body()?,
        ))
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    // Bodies are datagram-sized; a length above u32::MAX cannot be built.
    put_u32(out, u32::try_from(len).unwrap_or(u32::MAX));
}

fn encode_key_reply(out: &mut Vec<u8>, reply: &KeyReply) {
    put_len(out, reply.dh_share.len());
    out.extend_from_slice(&reply.dh_share);
    out.extend_from_slice(&reply.hashed_key);
    out.extend_from_slice(&reply.candidates);
}

fn decode_key_reply(r: &mut Reader<'_>) -> Result<KeyReply> {
    let dh_len = r.len_field()?;
    let dh_share = r.bytes(dh_len)?.to_vec();
    let mut hashed_key = [0u8; SHA1_SIZE];
    hashed_key.copy_from_slice(r.bytes(SHA1_SIZE)?);
    Ok(KeyReply {
        dh_share,
        hashed_key,
        candidates: r.rest().to_vec(),
    })
}
