//! COPC index records and the chunked output container

pub mod info;
pub mod hierarchy;
pub mod container;

pub use info::CopcInfo;
pub use hierarchy::{HierarchyEntry, HierarchyWriter};
pub use container::{ContainerHeader, ContainerReader, ContainerSink};
