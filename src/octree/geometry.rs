//! Octree cube and point-to-key arithmetic

use crate::core::types::DVec3;
use crate::math::Aabb;

use super::key::SpatialKey;

/// Dense index of a voxel cell inside one octant
pub type CellId = i64;

/// Half size used when every point shares the same coordinates
const DEGENERATE_HALF_SIZE: f64 = 0.5;

/// Index of `v` along one axis of `n` cells of width `res` starting at `min`,
/// clamped to the grid
fn axis_index(v: f64, min: f64, res: f64, n: u64) -> u64 {
    if n <= 1 || !(res > 0.0) {
        return 0;
    }
    let i = ((v - min) / res).floor();
    if !(i >= 0.0) {
        0
    } else if i >= n as f64 {
        n - 1
    } else {
        i as u64
    }
}

/// Cubic octree over a point cloud: the root cube and the per-octant voxel grid
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OctreeGeometry {
    cube: Aabb,
    grid_size: u32,
}

impl OctreeGeometry {
    /// Cube centered on `bounds` enclosing its longest side
    pub fn new(bounds: &Aabb, grid_size: u32) -> Self {
        let mut cube = bounds.bounding_cube();
        if !(cube.longest_side() > 0.0) {
            cube = Aabb::from_center_half_extent(bounds.center(), DVec3::splat(DEGENERATE_HALF_SIZE));
        }
        Self { cube, grid_size: grid_size.max(1) }
    }

    /// Depth at which octants hold about `max_points_per_octant` points.
    ///
    /// Point clouds are mostly 2.5D surfaces, so each level divides the
    /// population by four rather than eight.
    pub fn compute_max_depth(point_count: u64, max_points_per_octant: u64) -> u32 {
        let mut depth = 0;
        let mut n = point_count;
        let per_octant = max_points_per_octant.max(1);
        while n > per_octant {
            n /= 4;
            depth += 1;
        }
        depth
    }

    pub fn cube(&self) -> &Aabb {
        &self.cube
    }

    pub fn center(&self) -> DVec3 {
        self.cube.center()
    }

    pub fn halfsize(&self) -> f64 {
        self.cube.longest_side() * 0.5
    }

    pub fn size(&self) -> f64 {
        self.cube.longest_side()
    }

    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Voxel edge length at the root
    pub fn spacing(&self) -> f64 {
        self.size() / self.grid_size as f64
    }

    /// Voxel edge length at `depth`
    pub fn voxel_size(&self, depth: u32) -> f64 {
        self.spacing() / (1u64 << depth) as f64
    }

    pub fn key_bounds(&self, key: &SpatialKey) -> Aabb {
        key.bbox(&self.cube)
    }

    /// Key of the octant containing `pos` at `depth`
    pub fn key_at(&self, pos: DVec3, depth: u8) -> SpatialKey {
        let n = 1u64 << depth;
        let res = self.size() / n as f64;
        let min = self.cube.min;
        SpatialKey {
            depth,
            x: axis_index(pos.x, min.x, res, n) as u32,
            y: axis_index(pos.y, min.y, res, n) as u32,
            z: axis_index(pos.z, min.z, res, n) as u32,
        }
    }

    /// Child of `key` containing `pos`
    pub fn child_containing(&self, key: &SpatialKey, pos: DVec3) -> SpatialKey {
        let center = self.key_bounds(key).center();
        let index = (pos.x >= center.x) as u8
            | (((pos.y >= center.y) as u8) << 1)
            | (((pos.z >= center.z) as u8) << 2);
        key.child(index)
    }

    /// Voxel cell of `pos` inside the octant `key`
    pub fn cell_id(&self, pos: DVec3, key: &SpatialKey) -> CellId {
        let bounds = self.key_bounds(key);
        let n = self.grid_size as u64;
        let res = bounds.size().x / n as f64;
        let xi = axis_index(pos.x, bounds.min.x, res, n);
        let yi = axis_index(pos.y, bounds.min.y, res, n);
        let zi = axis_index(pos.z, bounds.min.z, res, n);
        ((zi * n + yi) * n + xi) as CellId
    }
}
