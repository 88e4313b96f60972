//! Per-level swap probabilities

/// Probability that a colliding point swaps with the occupant of a voxel
/// expected to hold `expected` points, so that over the whole population
/// at least one swap happens with probability `event_probability`.
///
/// Voxels expected to hold fewer than `min_population` points never swap.
pub fn swap_probability(expected: u64, event_probability: f64, min_population: u64) -> f64 {
    if expected == 0 || expected < min_population {
        return 0.0;
    }
    1.0 - (1.0 - event_probability).powf(1.0 / expected as f64)
}

/// Swap probability of every octree level
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwapSchedule {
    probabilities: Vec<f64>,
}

impl SwapSchedule {
    /// Schedule for levels `0..=depth_limit` of an octree whose root is
    /// `root_size` wide with `grid_size` voxels per axis, over a surface of
    /// `density` points per square unit
    pub fn new(
        root_size: f64,
        grid_size: u32,
        density: f64,
        depth_limit: u32,
        event_probability: f64,
        min_population: u64,
    ) -> Self {
        let mut voxel = root_size / grid_size.max(1) as f64;
        let probabilities = (0..=depth_limit)
            .map(|_| {
                let expected = (voxel * voxel * density) as u64;
                voxel *= 0.5;
                swap_probability(expected, event_probability, min_population)
            })
            .collect();
        Self { probabilities }
    }

    /// Probability at `level`; 0 past the last computed level
    pub fn probability(&self, level: u32) -> f64 {
        self.probabilities.get(level as usize).copied().unwrap_or(0.0)
    }

    pub fn levels(&self) -> usize {
        self.probabilities.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.probabilities.iter().copied()
    }
}
