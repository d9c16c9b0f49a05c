//! Byte-counter sampling and stats reports.
//!
//! The sampler runs at 1 Hz. A sample is appended only when a counter moved;
//! speed is `Δbytes / Δt` over the two most recent samples.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tribler_wire::stats::{CircuitStats, RelayStats};
use tribler_wire::StatsReport;

use crate::engine::TunnelCounters;
use crate::peer::LinkKey;
use crate::tables::TunnelTables;

/// Samples kept per circuit or relay.
const MAX_SAMPLES: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq)]
struct CircuitSample {
    bytes_up: u64,
    bytes_down: u64,
    at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RelaySample {
    bytes: u64,
    at: Instant,
}

/// Rolling per-circuit and per-relay samples.
#[derive(Debug)]
pub struct StatsCollector {
    started: Instant,
    circuits: HashMap<u32, VecDeque<CircuitSample>>,
    relays: HashMap<LinkKey, VecDeque<RelaySample>>,
}

impl StatsCollector {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            circuits: HashMap::new(),
            relays: HashMap::new(),
        }
    }

    /// Take one sample of every circuit and relay.
    pub fn sample(&mut self, tables: &TunnelTables, now: Instant) {
        self.circuits.retain(|id, _| tables.circuits.contains_key(id));
        self.relays.retain(|key, _| tables.relays.contains_key(key));

        for (id, circuit) in &tables.circuits {
            let samples = self.circuits.entry(*id).or_default();
            let advanced = samples.back().map_or(true, |last| {
                last.bytes_up != circuit.bytes_up || last.bytes_down != circuit.bytes_down
            });
            if advanced {
                push_bounded(
                    samples,
                    CircuitSample {
                        bytes_up: circuit.bytes_up,
                        bytes_down: circuit.bytes_down,
                        at: now,
                    },
                );
            }
        }

        for (key, relay) in &tables.relays {
            let samples = self.relays.entry(*key).or_default();
            if samples.back().map_or(true, |last| last.bytes != relay.bytes) {
                push_bounded(
                    samples,
                    RelaySample {
                        bytes: relay.bytes,
                        at: now,
                    },
                );
            }
        }
    }

    /// `(up, down)` bytes per second of a circuit.
    pub fn circuit_speed(&self, circuit_id: u32) -> (f64, f64) {
        let Some(samples) = self.circuits.get(&circuit_id) else {
            return (0.0, 0.0);
        };
        match last_two(samples) {
            Some((prev, last)) => {
                let dt = last.at.saturating_duration_since(prev.at).as_secs_f64();
                if dt <= 0.0 {
                    return (0.0, 0.0);
                }
                (
                    last.bytes_up.saturating_sub(prev.bytes_up) as f64 / dt,
                    last.bytes_down.saturating_sub(prev.bytes_down) as f64 / dt,
                )
            }
            None => (0.0, 0.0),
        }
    }

    /// Bytes per second arriving on one relay side.
    pub fn relay_speed(&self, key: &LinkKey) -> f64 {
        let Some((prev, last)) = self.relays.get(key).and_then(last_two) else {
            return 0.0;
        };
        let dt = last.at.saturating_duration_since(prev.at).as_secs_f64();
        if dt <= 0.0 {
            return 0.0;
        }
        last.bytes.saturating_sub(prev.bytes) as f64 / dt
    }

    /// Build a report from the current tables and counters.
    pub fn report(&self, tables: &TunnelTables, counters: &TunnelCounters, now: Instant) -> StatsReport {
        let mut circuits: Vec<CircuitStats> = tables
            .circuits
            .values()
            .map(|c| {
                let (speed_up, speed_down) = self.circuit_speed(c.id());
                CircuitStats {
                    circuit_id: c.id(),
                    hops: u8::try_from(c.goal_hops()).unwrap_or(u8::MAX),
                    bytes_up: c.bytes_up,
                    bytes_down: c.bytes_down,
                    speed_up,
                    speed_down,
                    age_secs: now.saturating_duration_since(c.created_at()).as_secs(),
                }
            })
            .collect();
        circuits.sort_by_key(|c| c.circuit_id);

        let mut relays: Vec<RelayStats> = tables
            .relays
            .iter()
            .map(|(key, r)| RelayStats {
                circuit_id: key.circuit_id,
                bytes: r.bytes,
                speed: self.relay_speed(key),
            })
            .collect();
        relays.sort_by_key(|r| r.circuit_id);

        StatsReport {
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            bytes_up: counters.bytes_up,
            bytes_down: counters.bytes_down,
            bytes_relay_up: counters.bytes_relay_up,
            bytes_relay_down: counters.bytes_relay_down,
            bytes_exit: counters.bytes_exit,
            dropped_exit: counters.dropped_exit,
            circuits,
            relays,
        }
    }
}

fn push_bounded<T>(samples: &mut VecDeque<T>, sample: T) {
    if samples.len() == MAX_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(sample);
}

fn last_two<T: Copy>(samples: &VecDeque<T>) -> Option<(T, T)> {
    let n = samples.len();
    if n < 2 {
        return None;
    }
    Some((samples[n - 2], samples[n - 1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::peer::Peer;
    use crate::strategy::NeighbourSubset;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tribler_crypto::x25519::X25519PublicKey;

    fn tables_with_circuit(now: Instant) -> TunnelTables {
        let mut t = TunnelTables::default();
        let peer = Peer::new(
            SocketAddr::from(([127, 0, 0, 1], 1)),
            X25519PublicKey::from_bytes([1; 32]),
        );
        t.circuits
            .insert(7, Circuit::new(7, 2, peer, Box::new(NeighbourSubset), now));
        t
    }

    #[test]
    fn test_speed_from_samples() {
        let t0 = Instant::now();
        let mut tables = tables_with_circuit(t0);
        let mut collector = StatsCollector::new(t0);
        collector.sample(&tables, t0);

        if let Some(c) = tables.circuits.get_mut(&7) {
            c.bytes_up = 2000;
            c.bytes_down = 500;
        }
        collector.sample(&tables, t0 + Duration::from_secs(2));
        let (up, down) = collector.circuit_speed(7);
        assert!((up - 1000.0).abs() < f64::EPSILON);
        assert!((down - 250.0).abs() < f64::EPSILON);

        // No movement: no new sample, speed keeps the last window.
        collector.sample(&tables, t0 + Duration::from_secs(3));
        assert_eq!(collector.circuits[&7].len(), 2);
    }

    #[test]
    fn test_samples_dropped_with_circuit() {
        let t0 = Instant::now();
        let mut tables = tables_with_circuit(t0);
        let mut collector = StatsCollector::new(t0);
        collector.sample(&tables, t0);
        tables.circuits.clear();
        collector.sample(&tables, t0 + Duration::from_secs(1));
        assert!(collector.circuits.is_empty());
        assert_eq!(collector.circuit_speed(7), (0.0, 0.0));
    }

    #[test]
    fn test_report() {
        let t0 = Instant::now();
        let tables = tables_with_circuit(t0);
        let collector = StatsCollector::new(t0);
        let counters = TunnelCounters {
            bytes_up: 5,
            ..TunnelCounters::default()
        };
        let report = collector.report(&tables, &counters, t0 + Duration::from_secs(90));
        assert_eq!(report.uptime_secs, 90);
        assert_eq!(report.bytes_up, 5);
        assert_eq!(report.circuits.len(), 1);
        assert_eq!(report.circuits[0].hops, 2);
    }
}
