//! Spill file layout and occupancy side-file I/O for on-disk octants

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::core::types::Result;
use crate::core::{Error, IoResultExt};
use crate::octant::{Occupancy, VoxelRecord};
use crate::octree::{CellId, SpatialKey};

static SPILL_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// One occupancy entry as written to the side file
///
/// Fixed 16-byte little-endian record, read back with
/// `bytemuck::pod_read_unaligned`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SpilledVoxel {
    pub cell: i64,
    pub position: i32,
    pub buffer_id: u16,
    pub _pad: u16,
}

impl SpilledVoxel {
    pub const SIZE: usize = std::mem::size_of::<SpilledVoxel>();

    pub fn new(cell: CellId, record: VoxelRecord) -> Self {
        Self {
            cell,
            position: record.position,
            buffer_id: record.buffer_id,
            _pad: 0,
        }
    }

    pub fn record(&self) -> VoxelRecord {
        VoxelRecord { buffer_id: self.buffer_id, position: self.position }
    }
}

/// Point file of an octant: `points-d-x-y-z.bin`
pub fn points_path(dir: &Path, key: &SpatialKey) -> PathBuf {
    dir.join(format!("points-{}.bin", key))
}

/// Occupancy side file of a deactivated octant: `octant-d-x-y-z.bin`
pub fn occupancy_path(dir: &Path, key: &SpatialKey) -> PathBuf {
    dir.join(format!("octant-{}.bin", key))
}

/// Create a private spill directory under `base`
pub fn create_spill_dir(base: &Path) -> Result<PathBuf> {
    let seq = SPILL_DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = base.join(format!(".copcbuild-{}-{}", std::process::id(), seq));
    std::fs::create_dir_all(&dir).with_path(&dir)?;
    log::debug!("Spill directory {}", dir.display());
    Ok(dir)
}

/// Remove a spill directory and everything left in it
pub fn remove_spill_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_path(dir)?;
    }
    Ok(())
}

/// Serialize an occupancy map
pub fn encode_occupancy(occupancy: &Occupancy) -> Vec<u8> {
    let records: Vec<SpilledVoxel> = occupancy
        .iter()
        .map(|(cell, record)| SpilledVoxel::new(cell, record))
        .collect();
    bytemuck::cast_slice(&records).to_vec()
}

/// Parse an occupancy map written by `encode_occupancy`
pub fn decode_occupancy(bytes: &[u8]) -> Result<Occupancy> {
    if bytes.len() % SpilledVoxel::SIZE != 0 {
        return Err(Error::Format(format!(
            "occupancy side file length {} is not a multiple of {}",
            bytes.len(),
            SpilledVoxel::SIZE
        )));
    }
    let mut occupancy = Occupancy::with_capacity(bytes.len() / SpilledVoxel::SIZE);
    for chunk in bytes.chunks_exact(SpilledVoxel::SIZE) {
        let voxel: SpilledVoxel = bytemuck::pod_read_unaligned(chunk);
        occupancy.insert(voxel.cell, voxel.record());
    }
    Ok(occupancy)
}

/// Write the occupancy side file
pub fn save_occupancy(path: &Path, occupancy: &Occupancy) -> Result<()> {
    std::fs::write(path, encode_occupancy(occupancy)).with_path(path)
}

/// Read the occupancy side file and delete it
pub fn take_occupancy(path: &Path) -> Result<Occupancy> {
    let bytes = std::fs::read(path).with_path(path)?;
    let occupancy = decode_occupancy(&bytes)?;
    std::fs::remove_file(path).with_path(path)?;
    Ok(occupancy)
}
