//! Out-of-core resources: descriptor budget and spill files

pub mod disk_io;
pub mod budget;

pub use disk_io::{
    SpilledVoxel,
    points_path, occupancy_path,
    create_spill_dir, remove_spill_dir,
    save_occupancy, take_occupancy,
};
pub use budget::{BudgetGuard, FileBudget};
