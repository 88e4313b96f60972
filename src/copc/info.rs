//! COPC info record

use crate::core::types::{DVec3, Result};
use crate::core::Error;

/// Global octree metadata, stored as a fixed 160-byte little-endian record
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CopcInfo {
    /// Center of the root octant
    pub center: DVec3,
    /// Half the edge length of the root octant
    pub halfsize: f64,
    /// Voxel spacing at the root (`2 * halfsize / grid_size`)
    pub spacing: f64,
    /// Offset of the first hierarchy entry, set when the output is closed
    pub root_hier_offset: u64,
    /// Length in bytes of the hierarchy entries
    pub root_hier_size: u64,
    pub gpstime_minimum: f64,
    pub gpstime_maximum: f64,
}

impl CopcInfo {
    pub const SIZE: usize = 160;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields: [[u8; 8]; 9] = [
            self.center.x.to_le_bytes(),
            self.center.y.to_le_bytes(),
            self.center.z.to_le_bytes(),
            self.halfsize.to_le_bytes(),
            self.spacing.to_le_bytes(),
            self.root_hier_offset.to_le_bytes(),
            self.root_hier_size.to_le_bytes(),
            self.gpstime_minimum.to_le_bytes(),
            self.gpstime_maximum.to_le_bytes(),
        ];
        // The remaining 11 u64 are reserved and stay zero
        for (slot, field) in out.chunks_exact_mut(8).zip(fields.iter()) {
            slot.copy_from_slice(field);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Format(format!(
                "COPC info record needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let word = |i: usize| -> [u8; 8] {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            w
        };
        let f = |i: usize| f64::from_le_bytes(word(i));
        Ok(Self {
            center: DVec3::new(f(0), f(1), f(2)),
            halfsize: f(3),
            spacing: f(4),
            root_hier_offset: u64::from_le_bytes(word(5)),
            root_hier_size: u64::from_le_bytes(word(6)),
            gpstime_minimum: f(7),
            gpstime_maximum: f(8),
        })
    }
}
