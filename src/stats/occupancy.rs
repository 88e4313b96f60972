//! Coarse 2D occupancy grid used to estimate point density

use std::collections::HashSet;

use crate::core::types::DVec3;

/// Set of occupied xy cells of a fixed edge length
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    resolution: f64,
    cells: HashSet<(i64, i64)>,
}

impl OccupancyGrid {
    pub fn new(resolution: f64) -> Self {
        Self { resolution, cells: HashSet::new() }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn add(&mut self, p: DVec3) {
        if !(self.resolution > 0.0) {
            self.cells.insert((0, 0));
            return;
        }
        let x = (p.x / self.resolution).floor() as i64;
        let y = (p.y / self.resolution).floor() as i64;
        self.cells.insert((x, y));
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    /// Covered area in square units
    pub fn area(&self) -> f64 {
        self.cells.len() as f64 * self.resolution * self.resolution
    }

    /// Points per square unit over the covered area, 0 when nothing is covered
    pub fn density(&self, points: u64) -> f64 {
        let area = self.area();
        if area > 0.0 { points as f64 / area } else { 0.0 }
    }
}
