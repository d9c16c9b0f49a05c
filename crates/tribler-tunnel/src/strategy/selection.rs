//! Picking one READY circuit for a flow.

use std::fmt;

use rand::seq::SliceRandom;
use rand::RngCore;

/// What a selection strategy sees of a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitSummary {
    pub circuit_id: u32,
    pub hops: usize,
}

/// Chooses a circuit from a list of READY circuits.
pub trait SelectionStrategy: Send + fmt::Debug {
    /// Whether [`select`](Self::select) would return a circuit.
    fn can_pick(&self, circuits: &[CircuitSummary]) -> bool;

    fn select(&mut self, circuits: &[CircuitSummary], rng: &mut dyn RngCore) -> Option<u32>;
}

/// Cycles through the list; needs at least `min_population` circuits.
#[derive(Clone, Debug)]
pub struct RoundRobin {
    min_population: usize,
    index: usize,
}

impl RoundRobin {
    pub fn new(min_population: usize) -> Self {
        Self {
            min_population: min_population.max(1),
            index: 0,
        }
    }
}

impl SelectionStrategy for RoundRobin {
    fn can_pick(&self, circuits: &[CircuitSummary]) -> bool {
        circuits.len() >= self.min_population
    }

    fn select(&mut self, circuits: &[CircuitSummary], _rng: &mut dyn RngCore) -> Option<u32> {
        if !self.can_pick(circuits) {
            return None;
        }
        let picked = circuits[self.index % circuits.len()].circuit_id;
        self.index = self.index.wrapping_add(1);
        Some(picked)
    }
}

/// Uniform choice; needs at least `min_population` circuits.
#[derive(Clone, Debug)]
pub struct RandomSelection {
    min_population: usize,
}

impl RandomSelection {
    pub fn new(min_population: usize) -> Self {
        Self {
            min_population: min_population.max(1),
        }
    }
}

impl SelectionStrategy for RandomSelection {
    fn can_pick(&self, circuits: &[CircuitSummary]) -> bool {
        circuits.len() >= self.min_population
    }

    fn select(&mut self, circuits: &[CircuitSummary], rng: &mut dyn RngCore) -> Option<u32> {
        if !self.can_pick(circuits) {
            return None;
        }
        circuits.choose(rng).map(|c| c.circuit_id)
    }
}

/// Uniform choice among circuits with `min <= hops <= max`.
#[derive(Clone, Debug)]
pub struct LengthFiltered {
    min: usize,
    max: usize,
}

impl LengthFiltered {
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    fn matching<'a>(&self, circuits: &'a [CircuitSummary]) -> Vec<&'a CircuitSummary> {
        circuits
            .iter()
            .filter(|c| (self.min..=self.max).contains(&c.hops))
            .collect()
    }
}

impl SelectionStrategy for LengthFiltered {
    fn can_pick(&self, circuits: &[CircuitSummary]) -> bool {
        !self.matching(circuits).is_empty()
    }

    fn select(&mut self, circuits: &[CircuitSummary], rng: &mut dyn RngCore) -> Option<u32> {
        self.matching(circuits).choose(rng).map(|c| c.circuit_id)
    }
}
