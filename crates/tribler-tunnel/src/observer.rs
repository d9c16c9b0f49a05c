//! Observer hooks raised by the engine.
//!
//! Observers run synchronously on the engine loop, after the engine has
//! released the table lock.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tribler_wire::{HostPort, StatsReport};

use crate::peer::LinkKey;

/// Something subscribers may care about.
#[derive(Clone, Debug, PartialEq)]
pub enum TunnelEvent {
    CircuitReady {
        circuit_id: u32,
        hops: usize,
    },
    BreakCircuit {
        circuit_id: u32,
        reason: String,
    },
    TunnelData {
        circuit_id: u32,
        origin: Option<HostPort>,
        payload: Vec<u8>,
    },
    TunnelStats {
        peer: SocketAddr,
        report: StatsReport,
    },
    ExitingFromTunnel {
        link: LinkKey,
        destination: HostPort,
    },
}

/// Subscriber interface. Every hook defaults to a no-op.
pub trait TunnelObserver: Send {
    fn on_circuit_ready(&mut self, _circuit_id: u32, _hops: usize) {}

    fn on_break_circuit(&mut self, _circuit_id: u32, _reason: &str) {}

    fn on_tunnel_data(&mut self, _circuit_id: u32, _origin: Option<&HostPort>, _payload: &[u8]) {}

    fn on_tunnel_stats(&mut self, _peer: SocketAddr, _report: &StatsReport) {}

    fn on_exiting_from_tunnel(&mut self, _link: LinkKey, _destination: &HostPort) {}
}

/// Route an event to the matching hook.
pub fn dispatch(observer: &mut dyn TunnelObserver, event: &TunnelEvent) {
    match event {
        TunnelEvent::CircuitReady { circuit_id, hops } => observer.on_circuit_ready(*circuit_id, *hops),
        TunnelEvent::BreakCircuit { circuit_id, reason } => {
            observer.on_break_circuit(*circuit_id, reason)
        }
        TunnelEvent::TunnelData {
            circuit_id,
            origin,
            payload,
        } => observer.on_tunnel_data(*circuit_id, origin.as_ref(), payload),
        TunnelEvent::TunnelStats { peer, report } => observer.on_tunnel_stats(*peer, report),
        TunnelEvent::ExitingFromTunnel { link, destination } => {
            observer.on_exiting_from_tunnel(*link, destination)
        }
    }
}

/// Forwards every event into an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TunnelEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<TunnelEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: TunnelEvent) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl TunnelObserver for ChannelObserver {
    fn on_circuit_ready(&mut self, circuit_id: u32, hops: usize) {
        self.forward(TunnelEvent::CircuitReady { circuit_id, hops });
    }

    fn on_break_circuit(&mut self, circuit_id: u32, reason: &str) {
        self.forward(TunnelEvent::BreakCircuit {
            circuit_id,
            reason: reason.to_string(),
        });
    }

    fn on_tunnel_data(&mut self, circuit_id: u32, origin: Option<&HostPort>, payload: &[u8]) {
        self.forward(TunnelEvent::TunnelData {
            circuit_id,
            origin: origin.cloned(),
            payload: payload.to_vec(),
        });
    }

    fn on_tunnel_stats(&mut self, peer: SocketAddr, report: &StatsReport) {
        self.forward(TunnelEvent::TunnelStats {
            peer,
            report: report.clone(),
        });
    }

    fn on_exiting_from_tunnel(&mut self, link: LinkKey, destination: &HostPort) {
        self.forward(TunnelEvent::ExitingFromTunnel {
            link,
            destination: destination.clone(),
        });
    }
}
