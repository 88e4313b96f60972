//! Build configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::core::{Error, IoResultExt};
use crate::octant::Backend;

/// Occupancy grid cell edge for metric input
const OCCUPANCY_RESOLUTION_METERS: f64 = 50.0;
/// Occupancy grid cell edge for input in feet
const OCCUPANCY_RESOLUTION_FEET: f64 = 160.0;
/// Deepest level any build may use
pub const MAX_DEPTH_LIMIT: u32 = 10;

/// Horizontal units of the input coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    Meters,
    Feet,
}

/// Root voxel grid presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootDensity {
    Light,
    Medium,
    Dense,
}

impl RootDensity {
    pub fn grid_size(self) -> u32 {
        match self {
            RootDensity::Light => 128,
            RootDensity::Medium => 256,
            RootDensity::Dense => 512,
        }
    }

    fn points_factor(self) -> u64 {
        match self {
            RootDensity::Light => 1,
            RootDensity::Medium => 2,
            RootDensity::Dense => 4,
        }
    }
}

/// Parameters of one octree build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Fixed maximum depth; estimated from the point count when `None`
    pub max_depth: Option<u32>,
    /// Ceiling for the estimated depth
    pub depth_limit: u32,
    /// Target points per leaf used by the depth estimate
    pub max_points_per_octant: u64,
    /// Finalized non-root octants at or below this count merge into an ancestor
    pub min_points_per_octant: usize,
    /// Voxel grid cells per axis in each octant
    pub root_grid_size: u32,
    /// Edge of the density estimation grid; by default 50 (160 in feet)
    pub occupancy_resolution: Option<f64>,
    /// Per-voxel probability that a swap happens as the population grows
    pub swap_event_probability: f64,
    /// Levels with fewer expected points per voxel never swap
    pub min_expected_population: u64,
    /// Points per shuffle buffer
    pub shuffle_buffer_points: usize,
    pub shuffle: bool,
    pub swap: bool,
    pub sort: bool,
    /// Eight filtered passes, one per root child
    pub unordered: bool,
    pub backend: Backend,
    /// Hard ceiling on open spill files
    pub max_files: usize,
    /// Parent of the spill directory; the system temp dir when `None`
    pub tmpdir: Option<PathBuf>,
    pub seed: u64,
    pub units: Option<Units>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            depth_limit: 10,
            max_points_per_octant: 100_000,
            min_points_per_octant: 100,
            root_grid_size: 256,
            occupancy_resolution: None,
            swap_event_probability: 0.95,
            min_expected_population: 5,
            shuffle_buffer_points: 1_000_000,
            shuffle: true,
            swap: true,
            sort: true,
            unordered: false,
            backend: Backend::InMemory,
            max_files: 1000,
            tmpdir: None,
            seed: 0,
            units: None,
        }
    }
}

impl BuildConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a root grid preset
    pub fn with_root_density(mut self, density: RootDensity) -> Self {
        self.root_grid_size = density.grid_size();
        self.max_points_per_octant *= density.points_factor();
        self
    }

    /// Terrestrial scans: coarse root grid, large octants, unordered passes
    pub fn tls(mut self) -> Self {
        self.root_grid_size = 128;
        self.max_points_per_octant = 1_000_000;
        self.unordered = true;
        self
    }

    /// Shuffle buffer size actually used
    pub fn effective_buffer_points(&self) -> usize {
        if self.unordered || self.backend == Backend::OnDisk {
            self.shuffle_buffer_points.saturating_mul(2)
        } else {
            self.shuffle_buffer_points
        }
    }

    pub fn effective_occupancy_resolution(&self) -> f64 {
        self.occupancy_resolution.unwrap_or(match self.units {
            Some(Units::Feet) => OCCUPANCY_RESOLUTION_FEET,
            _ => OCCUPANCY_RESOLUTION_METERS,
        })
    }

    /// Spill directory parent
    pub fn spill_base(&self) -> PathBuf {
        self.tmpdir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_grid_size == 0 {
            return Err(Error::Config("root grid size must be positive".into()));
        }
        if !(self.swap_event_probability > 0.0 && self.swap_event_probability < 1.0) {
            return Err(Error::Config(format!(
                "swap event probability {} is not in (0, 1)",
                self.swap_event_probability
            )));
        }
        if self.max_files < 2 {
            return Err(Error::Config(format!("max_files {} is below 2", self.max_files)));
        }
        if self.shuffle_buffer_points == 0 {
            return Err(Error::Config("shuffle buffer must hold at least one point".into()));
        }
        if self.max_points_per_octant == 0 {
            return Err(Error::Config("max points per octant must be positive".into()));
        }
        if self.depth_limit > MAX_DEPTH_LIMIT {
            return Err(Error::Config(format!(
                "depth limit {} exceeds {}",
                self.depth_limit, MAX_DEPTH_LIMIT
            )));
        }
        if let Some(depth) = self.max_depth {
            if depth > self.depth_limit {
                return Err(Error::Config(format!(
                    "max depth {} exceeds the depth limit {}",
                    depth, self.depth_limit
                )));
            }
        }
        if let Some(res) = self.occupancy_resolution {
            if !(res > 0.0) {
                return Err(Error::Config(format!("occupancy resolution {} must be positive", res)));
            }
        }
        Ok(())
    }

    /// Save as pretty JSON
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        std::fs::write(path, json).with_path(path)
    }

    /// Load from JSON; missing fields take their defaults
    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_path(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let cfg = BuildConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.root_grid_size, 256);
        assert_eq!(cfg.effective_buffer_points(), 1_000_000);
        assert_eq!(cfg.effective_occupancy_resolution(), 50.0);
    }

    #[test]
    fn test_presets() {
        let cfg = BuildConfig::default().with_root_density(RootDensity::Dense);
        assert_eq!(cfg.root_grid_size, 512);
        assert_eq!(cfg.max_points_per_octant, 400_000);

        let tls = BuildConfig::default().tls();
        assert!(tls.unordered);
        assert_eq!(tls.root_grid_size, 128);
        assert_eq!(tls.effective_buffer_points(), 2_000_000);
    }

    #[test]
    fn test_units_change_occupancy_resolution() {
        let cfg = BuildConfig { units: Some(Units::Feet), ..Default::default() };
        assert_eq!(cfg.effective_occupancy_resolution(), 160.0);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            BuildConfig { root_grid_size: 0, ..Default::default() },
            BuildConfig { swap_event_probability: 1.0, ..Default::default() },
            BuildConfig { max_files: 1, ..Default::default() },
            BuildConfig { shuffle_buffer_points: 0, ..Default::default() },
            BuildConfig { max_depth: Some(11), ..Default::default() },
            BuildConfig { occupancy_resolution: Some(0.0), ..Default::default() },
            BuildConfig { depth_limit: 20, max_depth: Some(20), ..Default::default() },
            BuildConfig { depth_limit: MAX_DEPTH_LIMIT + 1, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{:?}", cfg);
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg/build.json");
        let cfg = BuildConfig { seed: 7, backend: Backend::OnDisk, ..Default::default() };
        cfg.save_json(&path).unwrap();
        assert_eq!(BuildConfig::load_json(&path).unwrap(), cfg);
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("partial.json");
        std::fs::write(&path, r#"{ "max_depth": 3, "swap": false }"#).unwrap();
        let cfg = BuildConfig::load_json(&path).unwrap();
        assert_eq!(cfg.max_depth, Some(3));
        assert!(!cfg.swap);
        assert_eq!(cfg.min_points_per_octant, 100);
    }
}
