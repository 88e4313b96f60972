//! Routing one point down the octree

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::core::types::Result;
use crate::octant::OctreeRegistry;
use crate::octree::{OctreeGeometry, SpatialKey};
use crate::point::{PointView, Scaling};

use super::schedule::SwapSchedule;

/// Everything a descent reads or updates besides the point itself
pub struct DescentContext<'a> {
    pub registry: &'a mut OctreeRegistry,
    pub geometry: &'a OctreeGeometry,
    pub scaling: &'a Scaling,
    pub schedule: &'a SwapSchedule,
    pub rng: &'a mut ChaCha8Rng,
    pub max_depth: u32,
    pub buffer_id: u16,
    pub swap: bool,
}

/// Insert `point` at the shallowest level whose voxel is free.
///
/// Starting at the root, a point whose voxel is already occupied moves on
/// to the child containing it. With the level's swap probability, and only
/// against an occupant from an earlier buffer, it first trades places with
/// the occupant and the evicted point continues instead. Leaves accept
/// every point. Returns the key of the octant that stored a point.
pub fn descend(point: &mut [u8], ctx: &mut DescentContext<'_>) -> Result<SpatialKey> {
    let mut key = SpatialKey::root();
    let mut level = 0u32;
    loop {
        let position = PointView::new(point).position(ctx.scaling);
        let cell = (level < ctx.max_depth).then(|| ctx.geometry.cell_id(position, &key));
        let octant = ctx.registry.get_or_create(key)?;

        let occupant = cell.and_then(|c| octant.occupancy().get(c).copied().map(|r| (c, r)));
        let Some((cell, occupant)) = occupant else {
            octant.insert(point, cell, ctx.buffer_id)?;
            return Ok(key);
        };

        if ctx.swap
            && occupant.buffer_id != ctx.buffer_id
            && ctx.rng.random::<f64>() < ctx.schedule.probability(level)
        {
            octant.swap(point, occupant.position)?;
            if let Some(record) = octant.occupancy_mut().get_mut(cell) {
                record.buffer_id = ctx.buffer_id;
            }
        }

        let position = PointView::new(point).position(ctx.scaling);
        key = ctx.geometry.child_containing(&key, position);
        level += 1;
    }
}
