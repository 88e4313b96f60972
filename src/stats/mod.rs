//! Pass-1 statistics

pub mod inventory;
pub mod occupancy;

pub use inventory::PointInventory;
pub use occupancy::OccupancyGrid;
