//! Octree addressing and finalization

pub mod key;
pub mod geometry;
pub mod finalizer;

pub use key::SpatialKey;
pub use geometry::{CellId, OctreeGeometry};
pub use finalizer::RegionFinalizer;
