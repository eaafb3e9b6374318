//! Work-geometry scheduling.
//!
//! Turns a task's logical iteration space into the global/local launch sizes a
//! particular device class expects. Everything here is a pure function of its
//! inputs so the VM can recompute geometry on every launch.

pub mod geometry;

pub use geometry::{compute_launch_geometry, largest_divisor, GeometryTuning};

use serde::{Deserialize, Serialize};

/// Global and local work sizes for one launch, one entry per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkGeometry {
    pub global: Vec<u64>,
    pub local: Vec<u64>,
}

impl WorkGeometry {
    pub fn dims(&self) -> usize {
        self.global.len()
    }

    /// Number of work-groups along each dimension.
    pub fn groups(&self) -> Vec<u64> {
        self.global
            .iter()
            .zip(&self.local)
            .map(|(g, l)| if *l == 0 { 0 } else { g / l })
            .collect()
    }
}

impl std::fmt::Display for WorkGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "global={:?} local={:?}", self.global, self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups() {
        let geometry = WorkGeometry {
            global: vec![1024, 64],
            local: vec![128, 4],
        };
        assert_eq!(geometry.dims(), 2);
        assert_eq!(geometry.groups(), vec![8, 16]);
        assert_eq!(geometry.to_string(), "global=[1024, 64] local=[128, 4]");
    }
}
