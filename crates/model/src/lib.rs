//! Shared data model for the tilescout tiling optimizer.

pub mod error;
pub mod layer;

pub use error::{Error, Result};
pub use layer::{DimMap, LayerDescriptor, OptimizationResult, TilingConfig};
