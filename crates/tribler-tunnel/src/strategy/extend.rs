//! Choosing the next hop of an extending circuit.
//!
//! Extend strategies are pure: they look at the candidate list returned by
//! the current end of the circuit and answer with an [`ExtendAction`]. The
//! engine turns that action into PUNCTURE and EXTEND frames.

use std::fmt;
use std::net::SocketAddr;

use rand::seq::SliceRandom;
use rand::RngCore;
use tribler_wire::CandidateEntry;

use crate::peer::Peer;
use crate::{Result, TunnelError};

/// What the circuit sees when it must pick a next hop.
#[derive(Clone, Copy, Debug)]
pub struct ExtendContext<'a> {
    /// Decrypted candidate list from the last confirmed hop.
    pub candidates: &'a [CandidateEntry],
    /// Known addresses already on the circuit.
    pub on_circuit: &'a [SocketAddr],
    /// Our own overlay address.
    pub own_address: SocketAddr,
    /// Index of the hop being added (1 for the second hop).
    pub hop_index: usize,
}

/// The next step of an extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtendAction {
    /// `None` lets the current end of the circuit pick.
    pub target: Option<Peer>,
    /// Ask the current end to punch a NAT hole towards `target` first.
    pub puncture: bool,
}

/// Drives the EXTEND of one circuit. Owned by the circuit.
pub trait ExtendStrategy: Send + fmt::Debug {
    fn next_hop(&mut self, ctx: &ExtendContext<'_>, rng: &mut dyn RngCore)
        -> Result<ExtendAction>;
}

/// Trust-thy-neighbour: the end of the circuit picks from its own view.
#[derive(Clone, Copy, Debug, Default)]
pub struct Delegate;

impl ExtendStrategy for Delegate {
    fn next_hop(
        &mut self,
        _ctx: &ExtendContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<ExtendAction> {
        Ok(ExtendAction {
            target: None,
            puncture: false,
        })
    }
}

/// First advertised candidate that is neither on the circuit nor us.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeighbourSubset;

impl ExtendStrategy for NeighbourSubset {
    fn next_hop(
        &mut self,
        ctx: &ExtendContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<ExtendAction> {
        let pick = ctx
            .candidates
            .iter()
            .find(|c| c.address != ctx.own_address && !ctx.on_circuit.contains(&c.address))
            .ok_or(TunnelError::NoCandidates)?;
        Ok(ExtendAction {
            target: Some(Peer::from(*pick)),
            puncture: false,
        })
    }
}

/// All hops planned at creation; a PUNCTURE precedes every EXTEND.
#[derive(Clone, Debug)]
pub struct RandomAPriori {
    planned: Vec<Peer>,
}

impl RandomAPriori {
    /// Plan `hops` distinct peers out of `candidates`, excluding
    /// `own_address`.
    pub fn plan(
        candidates: &[Peer],
        hops: usize,
        own_address: SocketAddr,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let eligible: Vec<Peer> = candidates
            .iter()
            .filter(|p| p.address != own_address)
            .copied()
            .collect();
        if eligible.len() < hops {
            return Err(TunnelError::NoCandidates);
        }
        let planned = eligible.choose_multiple(rng, hops).copied().collect();
        Ok(Self { planned })
    }

    /// Plan around a fixed first hop.
    pub fn plan_from(
        first_hop: Peer,
        candidates: &[Peer],
        hops: usize,
        own_address: SocketAddr,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let rest: Vec<Peer> = candidates
            .iter()
            .filter(|p| p.address != first_hop.address)
            .copied()
            .collect();
        let mut plan = Self::plan(&rest, hops.saturating_sub(1), own_address, rng)?;
        plan.planned.insert(0, first_hop);
        Ok(plan)
    }

    /// The planned first hop.
    pub fn first_hop(&self) -> Option<Peer> {
        self.planned.first().copied()
    }

    pub fn planned(&self) -> &[Peer] {
        &self.planned
    }
}

impl ExtendStrategy for RandomAPriori {
    fn next_hop(
        &mut self,
        ctx: &ExtendContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<ExtendAction> {
        let target = self
            .planned
            .get(ctx.hop_index)
            .copied()
            .ok_or(TunnelError::NoCandidates)?;
        Ok(ExtendAction {
            target: Some(target),
            puncture: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tribler_crypto::x25519::X25519PublicKey;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn entry(port: u16) -> CandidateEntry {
        CandidateEntry {
            address: addr(port),
            public_key: X25519PublicKey::from_bytes([port as u8; 32]),
        }
    }

    #[test]
    fn test_subset_skips_circuit_and_self() {
        let mut rng = StdRng::seed_from_u64(0);
        let candidates = [entry(1), entry(2), entry(3)];
        let on_circuit = [addr(1)];
        let ctx = ExtendContext {
            candidates: &candidates,
            on_circuit: &on_circuit,
            own_address: addr(2),
            hop_index: 1,
        };
        let action = NeighbourSubset.next_hop(&ctx, &mut rng).expect("pick");
        assert_eq!(action.target.map(|p| p.address), Some(addr(3)));
        assert!(!action.puncture);
    }

    #[test]
    fn test_subset_empty_list_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        let ctx = ExtendContext {
            candidates: &[],
            on_circuit: &[],
            own_address: addr(9),
            hop_index: 1,
        };
        assert!(matches!(
            NeighbourSubset.next_hop(&ctx, &mut rng),
            Err(TunnelError::NoCandidates)
        ));
    }

    #[test]
    fn test_delegate_leaves_choice_to_relay() {
        let mut rng = StdRng::seed_from_u64(0);
        let ctx = ExtendContext {
            candidates: &[],
            on_circuit: &[],
            own_address: addr(9),
            hop_index: 1,
        };
        assert_eq!(
            Delegate.next_hop(&ctx, &mut rng).expect("delegate").target,
            None
        );
    }

    #[test]
    fn test_random_a_priori_follows_plan() {
        let mut rng = StdRng::seed_from_u64(11);
        let peers: Vec<Peer> = (1..=5).map(|p| Peer::from(entry(p))).collect();
        let mut plan = RandomAPriori::plan(&peers, 3, addr(1), &mut rng).expect("plan");
        assert_eq!(plan.planned().len(), 3);
        assert!(plan.planned().iter().all(|p| p.address != addr(1)));

        let ctx = ExtendContext {
            candidates: &[],
            on_circuit: &[],
            own_address: addr(1),
            hop_index: 2,
        };
        let action = plan.next_hop(&ctx, &mut rng).expect("planned");
        assert_eq!(action.target, Some(plan.planned()[2]));
        assert!(action.puncture);

        assert!(RandomAPriori::plan(&peers, 5, addr(1), &mut rng).is_err());
    }
}
