//! Engine settings and strategy selectors.

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tribler_wire::frame::DEFAULT_BYPASS_TAG;
use tribler_wire::stats::DEFAULT_STATS_BUDGET;
use tribler_wire::BypassTag;

use crate::peer::Peer;
use crate::strategy::{
    ConstantLength, Delegate, ExtendStrategy, LengthFiltered, LengthStrategy, NeighbourSubset,
    RandomAPriori, RandomLength, RandomSelection, RoundRobin, SelectionStrategy,
};
use crate::{
    Result, TunnelError, CANDIDATE_WALK_LIFETIME, CIRCUIT_IDLE_TIMEOUT, KEEPALIVE_INTERVAL,
    REQUEST_TIMEOUT,
};

/// Circuit length selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LengthPolicy {
    Constant { hops: usize },
    Random { min: usize, max: usize },
}

impl LengthPolicy {
    pub fn build(&self) -> Box<dyn LengthStrategy> {
        match *self {
            Self::Constant { hops } => Box::new(ConstantLength(hops)),
            Self::Random { min, max } => Box::new(RandomLength::new(min, max)),
        }
    }
}

impl Default for LengthPolicy {
    fn default() -> Self {
        Self::Constant { hops: 3 }
    }
}

/// Circuit selection selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionPolicy {
    RoundRobin { min_population: usize },
    Random { min_population: usize },
    Length { min: usize, max: usize },
}

impl SelectionPolicy {
    pub fn build(&self) -> Box<dyn SelectionStrategy> {
        match *self {
            Self::RoundRobin { min_population } => Box::new(RoundRobin::new(min_population)),
            Self::Random { min_population } => Box::new(RandomSelection::new(min_population)),
            Self::Length { min, max } => Box::new(LengthFiltered::new(min, max)),
        }
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::RoundRobin { min_population: 1 }
    }
}

/// Extend strategy selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendPolicy {
    #[default]
    Subset,
    Delegate,
    Random,
}

impl ExtendPolicy {
    /// Build the strategy that extends a new circuit, picking a first hop
    /// unless one is given.
    ///
    /// Random-a-priori plans every remaining hop now; the other policies
    /// take a random verified candidate as first hop.
    pub fn start(
        &self,
        first_hop: Option<Peer>,
        candidates: &[Peer],
        hops: usize,
        own_address: SocketAddr,
        rng: &mut dyn RngCore,
    ) -> Result<(Peer, Box<dyn ExtendStrategy>)> {
        use rand::seq::SliceRandom;

        if *self == Self::Random {
            let plan = match first_hop {
                Some(first) => RandomAPriori::plan_from(first, candidates, hops, own_address, rng)?,
                None => RandomAPriori::plan(candidates, hops, own_address, rng)?,
            };
            let first = plan.first_hop().ok_or(TunnelError::NoCandidates)?;
            return Ok((first, Box::new(plan)));
        }

        let first = match first_hop {
            Some(first) => first,
            None => {
                let eligible: Vec<&Peer> = candidates
                    .iter()
                    .filter(|p| p.address != own_address)
                    .collect();
                **eligible.choose(rng).ok_or(TunnelError::NoCandidates)?
            }
        };
        let strategy: Box<dyn ExtendStrategy> = match self {
            Self::Delegate => Box::new(Delegate),
            _ => Box::new(NeighbourSubset),
        };
        Ok((first, strategy))
    }
}

/// Everything the engine needs to know up front.
#[derive(Clone, Debug)]
pub struct TunnelSettings {
    /// Live circuits the top-up task maintains.
    pub max_circuits: usize,
    pub length: LengthPolicy,
    pub extend: ExtendPolicy,
    /// Default selection for client sessions.
    pub selection: SelectionPolicy,
    pub walk_lifetime: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub circuit_idle_timeout: Duration,
    /// Candidates advertised in CREATED.
    pub max_candidates_returned: usize,
    /// Allow goal-hops 0 (clear-text exit from this node).
    pub allow_zero_hop: bool,
    /// Act as exit for DATA with a destination.
    pub become_exit: bool,
    /// Encoded-size budget of STATS responses.
    pub stats_budget: usize,
    pub bypass_tag: BypassTag,
    /// Interval of the top-up task.
    pub top_up_interval: Duration,
    /// STATS crawl interval; `None` disables crawling.
    pub crawl_interval: Option<Duration>,
}

impl TunnelSettings {
    /// Relays idle longer than this are dropped.
    pub fn relay_idle_timeout(&self) -> Duration {
        self.walk_lifetime + crate::RELAY_IDLE_SLACK
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            max_circuits: 8,
            length: LengthPolicy::default(),
            extend: ExtendPolicy::default(),
            selection: SelectionPolicy::default(),
            walk_lifetime: CANDIDATE_WALK_LIFETIME,
            request_timeout: REQUEST_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            circuit_idle_timeout: CIRCUIT_IDLE_TIMEOUT,
            max_candidates_returned: tribler_wire::candidates::MAX_CANDIDATES,
            allow_zero_hop: false,
            become_exit: true,
            stats_budget: DEFAULT_STATS_BUDGET,
            bypass_tag: BypassTag::new(DEFAULT_BYPASS_TAG.to_vec()),
            top_up_interval: Duration::from_secs(5),
            crawl_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tribler_crypto::x25519::X25519PublicKey;

    fn peers(n: u16) -> Vec<Peer> {
        (1..=n)
            .map(|p| {
                Peer::new(
                    SocketAddr::from(([127, 0, 0, 1], p)),
                    X25519PublicKey::from_bytes([p as u8; 32]),
                )
            })
            .collect()
    }

    #[test]
    fn test_defaults() {
        let s = TunnelSettings::default();
        assert_eq!(s.relay_idle_timeout().as_secs(), 65);
        assert_eq!(s.max_candidates_returned, 4);
        assert_eq!(s.bypass_tag.as_bytes(), &[0xFF, 0xFF, 0xFF, 0xFE]);
        assert!(!s.allow_zero_hop);
    }

    #[test]
    fn test_start_excludes_self() {
        let mut rng = StdRng::seed_from_u64(5);
        let list = peers(3);
        let own = list[0].address;
        for policy in [ExtendPolicy::Subset, ExtendPolicy::Delegate, ExtendPolicy::Random] {
            let (first, _) = policy.start(None, &list, 2, own, &mut rng).expect("start");
            assert_ne!(first.address, own);
        }
        assert!(ExtendPolicy::Subset
            .start(None, &list[..1], 2, own, &mut rng)
            .is_err());
    }

    #[test]
    fn test_start_with_given_first_hop() {
        let mut rng = StdRng::seed_from_u64(6);
        let list = peers(4);
        let own = list[0].address;
        for policy in [ExtendPolicy::Subset, ExtendPolicy::Random] {
            let (first, _) = policy
                .start(Some(list[2]), &list, 3, own, &mut rng)
                .expect("start");
            assert_eq!(first, list[2]);
        }
    }
}
