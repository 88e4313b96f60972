//! Hierarchy index of flushed chunks

use std::collections::HashSet;

use crate::core::types::Result;
use crate::core::Error;
use crate::octree::SpatialKey;

/// Index record of one chunk.
///
/// Serialized in COPC order: `depth, x, y, z: i32`, `offset: u64`,
/// `byte_size: i32`, `point_count: i32`. An entry with `point_count == 0`
/// and no bytes marks an octant that holds nothing but has children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyEntry {
    pub key: SpatialKey,
    pub offset: u64,
    pub byte_size: i32,
    pub point_count: i32,
}

impl HierarchyEntry {
    pub const SIZE: usize = 32;

    pub fn empty(key: SpatialKey) -> Self {
        Self { key, offset: 0, byte_size: 0, point_count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.point_count <= 0
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.key.depth as i32).to_le_bytes());
        out.extend_from_slice(&(self.key.x as i32).to_le_bytes());
        out.extend_from_slice(&(self.key.y as i32).to_le_bytes());
        out.extend_from_slice(&(self.key.z as i32).to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.byte_size.to_le_bytes());
        out.extend_from_slice(&self.point_count.to_le_bytes());
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Format(format!("hierarchy entry truncated to {} bytes", bytes.len())));
        }
        let i32_at = |o: usize| i32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&bytes[16..24]);

        let (depth, x, y, z) = (i32_at(0), i32_at(4), i32_at(8), i32_at(12));
        let depth = u8::try_from(depth)
            .map_err(|_| Error::Format(format!("hierarchy entry with depth {}", depth)))?;
        if x < 0 || y < 0 || z < 0 {
            return Err(Error::Format(format!("hierarchy entry with key {}-{}-{}-{}", depth, x, y, z)));
        }
        Ok(Self {
            key: SpatialKey::new(depth, x as u32, y as u32, z as u32),
            offset: u64::from_le_bytes(offset),
            byte_size: i32_at(24),
            point_count: i32_at(28),
        })
    }

    /// Parse a serialized sequence of entries
    pub fn parse_all(bytes: &[u8]) -> Result<Vec<Self>> {
        if bytes.len() % Self::SIZE != 0 {
            return Err(Error::Format(format!(
                "hierarchy length {} is not a multiple of {}",
                bytes.len(),
                Self::SIZE
            )));
        }
        bytes.chunks_exact(Self::SIZE).map(Self::from_bytes).collect()
    }
}

/// Accumulates hierarchy entries until the output is closed
#[derive(Debug, Default)]
pub struct HierarchyWriter {
    entries: Vec<HierarchyEntry>,
    keys: HashSet<SpatialKey>,
}

impl HierarchyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flushed chunk. Each key may be recorded once.
    pub fn record(&mut self, entry: HierarchyEntry) -> Result<()> {
        if !self.keys.insert(entry.key) {
            return Err(Error::Invariant(format!("octant {} flushed twice", entry.key)));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Record an empty entry for a key without points, unless it already has one
    pub fn record_empty(&mut self, key: SpatialKey) {
        if self.keys.insert(key) {
            self.entries.push(HierarchyEntry::empty(key));
        }
    }

    pub fn has_entry(&self, key: &SpatialKey) -> bool {
        self.keys.contains(key)
    }

    pub fn has_child_entries(&self, key: &SpatialKey) -> bool {
        key.children().iter().any(|child| self.keys.contains(child))
    }

    /// Sum of point counts over all entries
    pub fn total_points(&self) -> u64 {
        self.entries.iter().map(|e| e.point_count.max(0) as u64).sum()
    }

    pub fn entries(&self) -> &[HierarchyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * HierarchyEntry::SIZE);
        for entry in &self.entries {
            entry.write_to(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let entry = HierarchyEntry {
            key: SpatialKey::new(2, 1, 3, 0),
            offset: 0x0102_0304_0506,
            byte_size: 77,
            point_count: 150,
        };
        let mut bytes = Vec::new();
        entry.write_to(&mut bytes);
        assert_eq!(bytes.len(), HierarchyEntry::SIZE);
        assert_eq!(&bytes[0..4], &2i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x0102_0304_0506u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &77i32.to_le_bytes());
        assert_eq!(&bytes[28..32], &150i32.to_le_bytes());
        assert_eq!(HierarchyEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_writer_rejects_duplicates() {
        let mut writer = HierarchyWriter::new();
        let entry = HierarchyEntry { key: SpatialKey::root(), offset: 0, byte_size: 10, point_count: 5 };
        writer.record(entry).unwrap();
        assert!(matches!(writer.record(entry), Err(Error::Invariant(_))));
        writer.record_empty(SpatialKey::root());
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_writer_counts_and_children() {
        let mut writer = HierarchyWriter::new();
        let child = SpatialKey::root().child(5);
        writer.record(HierarchyEntry { key: child, offset: 0, byte_size: 8, point_count: 120 }).unwrap();
        writer.record_empty(SpatialKey::root());
        writer.record(HierarchyEntry { key: child.child(0), offset: 8, byte_size: 8, point_count: 30 }).unwrap();

        assert_eq!(writer.total_points(), 150);
        assert!(writer.has_child_entries(&SpatialKey::root()));
        assert!(!writer.has_child_entries(&SpatialKey::root().child(1)));

        let parsed = HierarchyEntry::parse_all(&writer.to_bytes()).unwrap();
        assert_eq!(parsed, writer.entries());
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(HierarchyEntry::parse_all(&[0u8; 33]).is_err());
        let mut bytes = Vec::new();
        HierarchyEntry::empty(SpatialKey::root()).write_to(&mut bytes);
        bytes[0..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(HierarchyEntry::from_bytes(&bytes).is_err());
    }
}
