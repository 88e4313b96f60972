//! Region finalization tracking
//!
//! A coarse 3D grid of remaining-point counters over the cloud bounds. Pass 1
//! adds every point, pass 2 removes each one as it is placed; a region whose
//! cells all reach zero can receive no further points and may be flushed.

use crate::core::types::{DVec3, Result};
use crate::core::Error;
use crate::math::Aabb;

/// Largest grid the finalizer allocates; coarser grids only delay flushes
pub const MAX_CELLS: usize = 1 << 24;

/// Cell count along one axis for an extent, at least one
fn axis_cells(extent: f64, resolution: f64) -> usize {
    if !(resolution > 0.0) || !(extent > 0.0) {
        return 1;
    }
    ((extent / resolution).ceil() as usize).max(1)
}

fn clamp_index(v: f64, n: usize) -> usize {
    if !(v >= 0.0) {
        0
    } else if v >= n as f64 {
        n - 1
    } else {
        v as usize
    }
}

/// Remaining-point counters over a grid about `longest side / division` wide
#[derive(Debug, Clone)]
pub struct RegionFinalizer {
    origin: DVec3,
    resolution: f64,
    dims: [usize; 3],
    counts: Vec<u32>,
    remaining: u64,
}

impl RegionFinalizer {
    /// Cell dimensions and edge length of a grid over `bounds`; `None` if the cell count overflows
    fn layout(bounds: &Aabb, division: u32) -> Option<([usize; 3], f64, usize)> {
        let size = bounds.size();
        let longest = bounds.longest_side();
        let resolution = if longest > 0.0 { longest / division.max(1) as f64 } else { 0.0 };
        let dims = [
            axis_cells(size.x, resolution),
            axis_cells(size.y, resolution),
            axis_cells(size.z, resolution),
        ];
        let cells = dims[0].checked_mul(dims[1])?.checked_mul(dims[2])?;
        Some((dims, resolution, cells))
    }

    /// Grid over `bounds` where each cell edge is the longest side divided by `division`
    pub fn new(bounds: &Aabb, division: u32) -> Result<Self> {
        let (dims, resolution, cells) = Self::layout(bounds, division)
            .filter(|&(_, _, cells)| cells <= MAX_CELLS)
            .ok_or_else(|| {
                Error::Config(format!(
                    "finalizer grid with division {} exceeds {} cells",
                    division, MAX_CELLS
                ))
            })?;
        Ok(Self {
            origin: bounds.min,
            resolution,
            dims,
            counts: vec![0; cells],
            remaining: 0,
        })
    }

    /// Grid sized for an octree of `max_depth` levels, coarsened until it fits `MAX_CELLS`
    pub fn for_depth(bounds: &Aabb, max_depth: u32) -> Result<Self> {
        let mut division = 2u32 << max_depth.min(30);
        while division > 1
            && Self::layout(bounds, division).is_none_or(|(_, _, cells)| cells > MAX_CELLS)
        {
            division /= 2;
        }
        Self::new(bounds, division)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Points added and not yet removed
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn axis(&self, v: f64, min: f64, n: usize) -> usize {
        if self.resolution > 0.0 {
            clamp_index(((v - min) / self.resolution).floor(), n)
        } else {
            0
        }
    }

    fn cell_of(&self, p: DVec3) -> [usize; 3] {
        [
            self.axis(p.x, self.origin.x, self.dims[0]),
            self.axis(p.y, self.origin.y, self.dims[1]),
            self.axis(p.z, self.origin.z, self.dims[2]),
        ]
    }

    fn index(&self, [c, r, l]: [usize; 3]) -> usize {
        (l * self.dims[1] + r) * self.dims[0] + c
    }

    pub fn add(&mut self, p: DVec3) {
        let i = self.index(self.cell_of(p));
        self.counts[i] = self.counts[i].saturating_add(1);
        self.remaining += 1;
    }

    /// Decrement the cell holding `p`; true when that cell just reached zero
    pub fn remove(&mut self, p: DVec3) -> Result<bool> {
        let cell = self.cell_of(p);
        let i = self.index(cell);
        match self.counts[i] {
            0 => Err(Error::Invariant(format!(
                "finalizer cell {:?} decremented below zero at ({}, {}, {})",
                cell, p.x, p.y, p.z
            ))),
            n => {
                self.counts[i] = n - 1;
                self.remaining -= 1;
                Ok(n == 1)
            }
        }
    }

    /// True when no cell touching `region` still expects points
    pub fn is_finalized(&self, region: &Aabb) -> bool {
        if self.remaining == 0 {
            return true;
        }
        let range = |min: f64, max: f64, origin: f64, n: usize| {
            if self.resolution > 0.0 {
                let start = clamp_index(((min - origin) / self.resolution).floor(), n);
                let end = clamp_index(((max - origin) / self.resolution).ceil(), n);
                start..=end
            } else {
                0..=0
            }
        };
        let xs = range(region.min.x, region.max.x, self.origin.x, self.dims[0]);
        let ys = range(region.min.y, region.max.y, self.origin.y, self.dims[1]);
        let zs = range(region.min.z, region.max.z, self.origin.z, self.dims[2]);

        let mut sum = 0u64;
        for l in zs {
            for r in ys.clone() {
                for c in xs.clone() {
                    sum += self.counts[self.index([c, r, l])] as u64;
                }
            }
        }
        sum == 0
    }
}
