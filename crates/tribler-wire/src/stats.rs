//! Peer statistics exchanged in STATS messages.
//!
//! STATS always travels on circuit 0. The body is `len u32 ‖ CBOR` so a
//! receiver can reject truncated payloads before handing bytes to the CBOR
//! decoder.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::reader::Reader;
use crate::{Result, WireError};

/// Default encoded-size budget for a stats response.
pub const DEFAULT_STATS_BUDGET: usize = 1000;

/// Aggregate counters of one node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub uptime_secs: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub bytes_relay_up: u64,
    pub bytes_relay_down: u64,
    pub bytes_exit: u64,
    pub dropped_exit: u64,
    pub circuits: Vec<CircuitStats>,
    pub relays: Vec<RelayStats>,
}

/// Counters of one originated circuit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub circuit_id: u32,
    pub hops: u8,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Bytes per second over the last sample window.
    pub speed_up: f64,
    pub speed_down: f64,
    pub age_secs: u64,
}

/// Counters of one relay direction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    pub circuit_id: u32,
    pub bytes: u64,
    pub speed: f64,
}

/// Body of a STATS message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatsPayload {
    Request,
    Response(StatsReport),
}

impl StatsPayload {
    /// Encode as `len u32 ‖ CBOR`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let cbor = to_vec(self)?;
        let len = u32::try_from(cbor.len())
            .map_err(|_| WireError::Serialization("stats payload too large".into()))?;
        let mut out = Vec::with_capacity(4 + cbor.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&cbor);
        Ok(out)
    }

    /// Decode a `len u32 ‖ CBOR` body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let len = r.len_field()?;
        let payload = from_slice(r.bytes(len)?)?;
        r.finish()?;
        Ok(payload)
    }

    /// Encode a response, dropping per-circuit then per-relay entries until
    /// the body fits `budget` bytes.
    pub fn encode_response_within(report: &StatsReport, budget: usize) -> Result<Vec<u8>> {
        let mut report = report.clone();
        loop {
            let bytes = Self::Response(report.clone()).encode()?;
            if bytes.len() <= budget {
                return Ok(bytes);
            }
            if report.circuits.pop().is_none() && report.relays.pop().is_none() {
                // Only the fixed counters remain; send them regardless.
                return Ok(bytes);
            }
        }
    }
}

/// Serialize a value to CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| WireError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data)
        .map_err(|e| WireError::Deserialization(format!("CBOR deserialization failed: {e}")))
}
