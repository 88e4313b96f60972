//! Octree clustering: configuration, sampling and the two-pass builder

pub mod config;
pub mod schedule;
pub mod shuffle;
pub mod descent;
pub mod cluster;

pub use config::{BuildConfig, RootDensity, Units, MAX_DEPTH_LIMIT};
pub use schedule::{swap_probability, SwapSchedule};
pub use shuffle::ShuffleBuffer;
pub use descent::{descend, DescentContext};
pub use cluster::{BuildReport, BuildState, ClusterBuilder, DepthEstimate};
