//! Points of variation: circuit length, circuit selection, next-hop choice.

pub mod extend;
pub mod length;
pub mod selection;

pub use extend::{
    Delegate, ExtendAction, ExtendContext, ExtendStrategy, NeighbourSubset, RandomAPriori,
};
pub use length::{ConstantLength, LengthStrategy, RandomLength};
pub use selection::{CircuitSummary, LengthFiltered, RandomSelection, RoundRobin, SelectionStrategy};
