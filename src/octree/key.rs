//! Hierarchical octant addresses

use std::fmt;

use crate::core::types::DVec3;
use crate::math::Aabb;

/// Address of one octant: depth plus integer position at that depth.
///
/// Ordering is by depth first, then x, y, z, so iterating a sorted map of
/// keys visits the tree level by level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpatialKey {
    pub depth: u8,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl SpatialKey {
    pub fn new(depth: u8, x: u32, y: u32, z: u32) -> Self {
        Self { depth, x, y, z }
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Child octant; index bit 0 = x, bit 1 = y, bit 2 = z
    pub fn child(&self, index: u8) -> Self {
        Self {
            depth: self.depth + 1,
            x: (self.x << 1) | (index & 1) as u32,
            y: (self.y << 1) | ((index >> 1) & 1) as u32,
            z: (self.z << 1) | ((index >> 2) & 1) as u32,
        }
    }

    pub fn children(&self) -> [SpatialKey; 8] {
        std::array::from_fn(|i| self.child(i as u8))
    }

    /// Parent octant, `None` at the root
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            depth: self.depth - 1,
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
        })
    }

    /// Ancestors from the parent up to the root
    pub fn ancestors(&self) -> impl Iterator<Item = SpatialKey> {
        std::iter::successors(self.parent(), |k| k.parent())
    }

    /// Bounds of this octant inside the root box
    pub fn bbox(&self, root: &Aabb) -> Aabb {
        let step = root.size() / (1u64 << self.depth) as f64;
        let min = root.min + step * DVec3::new(self.x as f64, self.y as f64, self.z as f64);
        Aabb::new(min, min + step)
    }
}

impl fmt::Display for SpatialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.depth, self.x, self.y, self.z)
    }
}
