//! Point records and the point stream collaborators

pub mod format;
pub mod buffer;
pub mod source;
pub mod text;
pub mod sink;

pub use format::{CloudHeader, PointFormat, PointRecord, PointView, Scaling};
pub use buffer::PointBuffer;
pub use source::{MemorySource, PointSource};
pub use text::{TextOptions, TextSource};
pub use sink::{MemorySink, PointSink};
