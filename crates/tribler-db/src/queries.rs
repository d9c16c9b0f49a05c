//! Query functions.

pub mod results;
