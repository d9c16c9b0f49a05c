//! How many hops a new circuit gets.

use std::fmt;

use rand::{Rng, RngCore};

/// Chooses `goal-hops` when a circuit is created.
pub trait LengthStrategy: Send + fmt::Debug {
    fn circuit_length(&self, rng: &mut dyn RngCore) -> usize;
}

/// Always `k` hops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantLength(pub usize);

impl LengthStrategy for ConstantLength {
    fn circuit_length(&self, _rng: &mut dyn RngCore) -> usize {
        self.0
    }
}

/// Uniform in `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RandomLength {
    min: usize,
    max: usize,
}

impl RandomLength {
    /// Bounds are swapped if given in the wrong order.
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }
}

impl LengthStrategy for RandomLength {
    fn circuit_length(&self, rng: &mut dyn RngCore) -> usize {
        rng.gen_range(self.min..=self.max)
    }
}
