//! copcbuild - out-of-core octree builder for Cloud Optimized Point Cloud files

pub mod core;
pub mod math;
pub mod point;
pub mod octree;
pub mod octant;
pub mod streaming;
pub mod stats;
pub mod copc;
pub mod builder;
