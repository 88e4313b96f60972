//! In-memory octant store

use crate::core::types::Result;
use crate::core::Error;
use crate::octree::CellId;
use crate::point::PointBuffer;

use super::{Occupancy, OctantStore, VoxelRecord};

/// Octant whose points live in a growable in-memory buffer
#[derive(Debug, Clone)]
pub struct MemoryOctant {
    points: PointBuffer,
    occupancy: Occupancy,
    loaded: bool,
}

impl MemoryOctant {
    pub fn new(record_len: usize) -> Self {
        Self {
            points: PointBuffer::new(record_len),
            occupancy: Occupancy::default(),
            loaded: false,
        }
    }

    fn loaded_points(&self) -> Result<&PointBuffer> {
        if self.loaded {
            Ok(&self.points)
        } else {
            Err(Error::Invariant("octant points accessed before load".into()))
        }
    }
}

impl OctantStore for MemoryOctant {
    fn insert(&mut self, record: &[u8], cell: Option<CellId>, buffer_id: u16) -> Result<()> {
        if record.len() != self.points.record_len() {
            return Err(Error::Invariant(format!(
                "record of {} bytes inserted into octant of {}-byte records",
                record.len(),
                self.points.record_len()
            )));
        }
        let position = i32::try_from(self.points.len())
            .map_err(|_| Error::Invariant("octant exceeds i32::MAX points".into()))?;
        self.points.push(record);
        if let Some(cell) = cell {
            self.occupancy.insert(cell, VoxelRecord { buffer_id, position });
        }
        Ok(())
    }

    fn occupancy(&self) -> &Occupancy {
        &self.occupancy
    }

    fn occupancy_mut(&mut self) -> &mut Occupancy {
        &mut self.occupancy
    }

    fn swap(&mut self, incoming: &mut [u8], position: i32) -> Result<()> {
        let index = usize::try_from(position)
            .ok()
            .filter(|&i| i < self.points.len() && incoming.len() == self.points.record_len())
            .ok_or_else(|| Error::Invariant(format!(
                "swap at position {} of an octant holding {} points",
                position,
                self.points.len()
            )))?;
        self.points.swap_with(index, incoming);
        Ok(())
    }

    fn npoints(&self) -> usize {
        self.points.len()
    }

    fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Err(Error::Invariant("octant loaded twice".into()));
        }
        self.loaded = true;
        Ok(())
    }

    fn sort(&mut self) -> Result<()> {
        self.loaded_points()?;
        self.points.sort_for_compression();
        Ok(())
    }

    fn points(&self) -> Result<&PointBuffer> {
        self.loaded_points()
    }

    fn clean(&mut self) -> Result<()> {
        self.points.release();
        self.occupancy.clear();
        Ok(())
    }
}
