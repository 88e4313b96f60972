//! Per-octant point storage
//!
//! An octant exists from the first point routed to its key until its region
//! is finalized and flushed. Two backends share the `OctantStore` contract:
//! everything in memory, or points spilled to one file per octant.

pub mod memory;
pub mod disk;
pub mod registry;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::octree::CellId;
use crate::point::PointBuffer;

pub use memory::MemoryOctant;
pub use disk::DiskOctant;
pub use registry::OctreeRegistry;

/// Which `OctantStore` the registry instantiates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    #[default]
    InMemory,
    OnDisk,
}

/// Occupant of one voxel cell: which buffer it came from and where it is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelRecord {
    pub buffer_id: u16,
    pub position: i32,
}

/// Occupied voxel cells of one octant
#[derive(Debug, Clone, Default)]
pub struct Occupancy {
    cells: HashMap<CellId, VoxelRecord>,
}

impl Occupancy {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { cells: HashMap::with_capacity(capacity) }
    }

    pub fn get(&self, cell: CellId) -> Option<&VoxelRecord> {
        self.cells.get(&cell)
    }

    pub fn get_mut(&mut self, cell: CellId) -> Option<&mut VoxelRecord> {
        self.cells.get_mut(&cell)
    }

    /// Register an occupant; a cell keeps its first occupant. Returns true if the cell was free.
    pub fn insert(&mut self, cell: CellId, record: VoxelRecord) -> bool {
        let before = self.cells.len();
        self.cells.entry(cell).or_insert(record);
        self.cells.len() > before
    }

    pub fn contains(&self, cell: CellId) -> bool {
        self.cells.contains_key(&cell)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drop every entry and the allocation
    pub fn clear(&mut self) {
        self.cells = HashMap::new();
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellId, VoxelRecord)> + '_ {
        self.cells.iter().map(|(&cell, &record)| (cell, record))
    }
}

/// Storage for the points of one octant.
///
/// `load` brings every point into memory for the flush and may be called
/// once; `sort` and `points` require it. `clean` releases everything.
pub trait OctantStore {
    /// Append a point; with a cell, also mark that cell occupied
    fn insert(&mut self, record: &[u8], cell: Option<CellId>, buffer_id: u16) -> Result<()>;

    fn occupancy(&self) -> &Occupancy;

    fn occupancy_mut(&mut self) -> &mut Occupancy;

    /// Exchange `incoming` with the stored point at `position`; `incoming`
    /// then holds the evicted point
    fn swap(&mut self, incoming: &mut [u8], position: i32) -> Result<()>;

    fn npoints(&self) -> usize;

    fn load(&mut self) -> Result<()>;

    /// Order the loaded points for compression locality
    fn sort(&mut self) -> Result<()>;

    /// Loaded points
    fn points(&self) -> Result<&PointBuffer>;

    fn clean(&mut self) -> Result<()>;

    /// Restore a deactivated octant; no-op for stores without external resources
    fn activate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release external resources until the next `activate`
    fn deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        true
    }

    fn has_open_handle(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy_keeps_first_occupant() {
        let mut occupancy = Occupancy::default();
        assert!(occupancy.insert(7, VoxelRecord { buffer_id: 1, position: 0 }));
        assert!(!occupancy.insert(7, VoxelRecord { buffer_id: 2, position: 5 }));
        assert_eq!(occupancy.get(7), Some(&VoxelRecord { buffer_id: 1, position: 0 }));
        assert_eq!(occupancy.len(), 1);
    }

    #[test]
    fn test_occupancy_update_and_clear() {
        let mut occupancy = Occupancy::default();
        occupancy.insert(1, VoxelRecord { buffer_id: 0, position: 3 });
        if let Some(record) = occupancy.get_mut(1) {
            record.buffer_id = 9;
        }
        assert_eq!(occupancy.get(1).map(|r| r.buffer_id), Some(9));
        occupancy.clear();
        assert!(occupancy.is_empty());
        assert!(!occupancy.contains(1));
    }
}
