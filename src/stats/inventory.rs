//! Running pass-1 point inventory

use crate::core::types::DVec3;
use crate::math::Aabb;
use crate::point::PointView;

/// Counts, bounds and GPS time range of the points actually read
#[derive(Debug, Clone, Default)]
pub struct PointInventory {
    count: u64,
    bounds: Aabb,
    gps_min: f64,
    gps_max: f64,
}

impl PointInventory {
    pub fn new() -> Self {
        Self {
            gps_min: f64::INFINITY,
            gps_max: f64::NEG_INFINITY,
            ..Default::default()
        }
    }

    pub fn add(&mut self, point: &PointView<'_>, position: DVec3) {
        self.count += 1;
        self.bounds.expand(position);
        let t = point.gps_time();
        self.gps_min = self.gps_min.min(t);
        self.gps_max = self.gps_max.max(t);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Bounds of the points read, empty if none
    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// GPS time range, `(0, 0)` when nothing was read
    pub fn gps_range(&self) -> (f64, f64) {
        if self.count == 0 {
            (0.0, 0.0)
        } else {
            (self.gps_min, self.gps_max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{PointFormat, PointRecord};

    #[test]
    fn test_inventory() {
        let mut inventory = PointInventory::new();
        assert_eq!(inventory.gps_range(), (0.0, 0.0));
        assert!(inventory.bounds().is_empty());

        let a = PointRecord::new(PointFormat::pdrf6()).with_gps_time(5.0).with_returns(1, 2);
        let b = PointRecord::new(PointFormat::pdrf6()).with_gps_time(-2.0).with_returns(2, 2);
        inventory.add(&a.view(), DVec3::new(1.0, 2.0, 3.0));
        inventory.add(&b.view(), DVec3::new(-1.0, 4.0, 0.0));

        assert_eq!(inventory.count(), 2);
        assert_eq!(inventory.gps_range(), (-2.0, 5.0));
        assert_eq!(inventory.bounds().min, DVec3::new(-1.0, 2.0, 0.0));
    }
}
