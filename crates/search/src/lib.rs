//! Tiling configuration generation.

pub mod factors;
pub mod generator;

pub use factors::factors;
pub use generator::{estimate_trial_count, generate_bounded, generate_exhaustive};
