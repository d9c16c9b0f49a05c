//! Event bus.
//!
//! Engine observer callbacks are turned into [`Event`]s and broadcast to
//! every subscriber. Each subscriber has an independent buffer; a slow one
//! loses the oldest events.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use tribler_tunnel::{LinkKey, TunnelObserver};
use tribler_wire::{HostPort, StatsReport};

/// An event emitted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type name (e.g. "CircuitReady", "TunnelStats").
    pub event_type: String,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn now(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: unix_now(),
            payload,
        }
    }
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Filter for event subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// "circuit", "exit", "data", "stats" or "system".
    pub categories: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Events emitted so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl EventFilter {
    pub fn only(category: &str) -> Self {
        Self {
            categories: Some(vec![category.to_string()]),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match &self.categories {
            Some(categories) => categories.iter().any(|c| c == categorize_event(&event.event_type)),
            None => true,
        }
    }
}

fn categorize_event(event_type: &str) -> &'static str {
    match event_type {
        "CircuitReady" | "BreakCircuit" => "circuit",
        "ExitingFromTunnel" => "exit",
        "TunnelData" => "data",
        "TunnelStats" => "stats",
        _ => "system",
    }
}

/// Engine observer that publishes on the bus.
pub struct BusObserver {
    bus: EventBus,
}

impl BusObserver {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl TunnelObserver for BusObserver {
    fn on_circuit_ready(&mut self, circuit_id: u32, hops: usize) {
        self.bus.emit(Event::now(
            "CircuitReady",
            serde_json::json!({ "circuit_id": circuit_id, "hops": hops }),
        ));
    }

    fn on_break_circuit(&mut self, circuit_id: u32, reason: &str) {
        self.bus.emit(Event::now(
            "BreakCircuit",
            serde_json::json!({ "circuit_id": circuit_id, "reason": reason }),
        ));
    }

    // Payload bytes stay off the bus.
    fn on_tunnel_data(&mut self, circuit_id: u32, origin: Option<&HostPort>, payload: &[u8]) {
        self.bus.emit(Event::now(
            "TunnelData",
            serde_json::json!({
                "circuit_id": circuit_id,
                "origin": origin.map(ToString::to_string),
                "bytes": payload.len(),
            }),
        ));
    }

    fn on_tunnel_stats(&mut self, peer: SocketAddr, report: &StatsReport) {
        match serde_json::to_value(report) {
            Ok(report) => self.bus.emit(Event::now(
                "TunnelStats",
                serde_json::json!({ "peer": peer.to_string(), "report": report }),
            )),
            Err(e) => warn!(%peer, error = %e, "stats report not serializable"),
        }
    }

    fn on_exiting_from_tunnel(&mut self, link: LinkKey, destination: &HostPort) {
        self.bus.emit(Event::now(
            "ExitingFromTunnel",
            serde_json::json!({
                "peer": link.peer.to_string(),
                "circuit_id": link.circuit_id,
                "destination": destination.to_string(),
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(Event {
            event_type: "DaemonStarted".to_string(),
            timestamp: 1000,
            payload: serde_json::json!({"version": "0.1.0"}),
        });

        let event = rx.try_recv().expect("receive event");
        assert_eq!(event.event_type, "DaemonStarted");
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_event_filter_categories() {
        let filter = EventFilter::only("stats");
        assert!(filter.matches(&Event::now("TunnelStats", serde_json::json!({}))));
        assert!(!filter.matches(&Event::now("CircuitReady", serde_json::json!({}))));
        assert!(EventFilter::default().matches(&Event::now("Anything", serde_json::json!({}))));
    }

    #[test]
    fn test_observer_publishes() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut observer = BusObserver::new(bus);

        observer.on_break_circuit(7, "timeout");
        let event = rx.try_recv().expect("break");
        assert_eq!(event.event_type, "BreakCircuit");
        assert_eq!(event.payload["circuit_id"], 7);
        assert_eq!(event.payload["reason"], "timeout");

        let peer: SocketAddr = "10.0.0.2:7000".parse().expect("addr");
        let report = StatsReport {
            bytes_exit: 12,
            ..StatsReport::default()
        };
        observer.on_tunnel_stats(peer, &report);
        let event = rx.try_recv().expect("stats");
        assert_eq!(event.payload["peer"], "10.0.0.2:7000");
        let decoded: StatsReport =
            serde_json::from_value(event.payload["report"].clone()).expect("report");
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_categorize_event() {
        assert_eq!(categorize_event("CircuitReady"), "circuit");
        assert_eq!(categorize_event("ExitingFromTunnel"), "exit");
        assert_eq!(categorize_event("TunnelStats"), "stats");
        assert_eq!(categorize_event("DaemonStarted"), "system");
    }
}
