//! Per-device-class launch geometry strategies.

use super::WorkGeometry;
use crate::config::Config;
use crate::device::{DeviceClass, DeviceLimits};
use crate::error::{Error, Result};

/// Tunables consulted by the geometry strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryTuning {
    pub gpu_block_x: u64,
    pub gpu_block_2d_x: u64,
    pub gpu_block_2d_y: u64,
    pub gpu_warp: u64,
    pub adjust_irregular: bool,
    pub cpu_block: u64,
    pub fpga_warp: u64,
    pub fpga_local_work: u64,
}

impl From<&Config> for GeometryTuning {
    fn from(config: &Config) -> Self {
        Self {
            gpu_block_x: config.gpu_block_x,
            gpu_block_2d_x: config.gpu_block_2d_x,
            gpu_block_2d_y: config.gpu_block_2d_y,
            gpu_warp: config.gpu_warp,
            adjust_irregular: config.adjust_irregular,
            cpu_block: config.cpu_block,
            fpga_warp: config.fpga_warp,
            fpga_local_work: config.fpga_local_work,
        }
    }
}

impl GeometryTuning {
    /// Reject tunables the strategies divide by.
    pub fn validate(&self) -> Result<()> {
        let divisors = [
            ("gpu_warp", self.gpu_warp),
            ("fpga_warp", self.fpga_warp),
            ("fpga_local_work", self.fpga_local_work),
        ];
        match divisors.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(Error::config(format!("geometry tunable {} must be > 0", name))),
            None => Ok(()),
        }
    }
}

impl Default for GeometryTuning {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Compute global and local work sizes for a launch.
///
/// `thread_override > 0` replaces the domain cardinality of every dimension;
/// the VM passes the batch thread count here.
pub fn compute_launch_geometry(
    class: DeviceClass,
    domain: &[u64],
    thread_override: u64,
    limits: &DeviceLimits,
    tuning: &GeometryTuning,
) -> Result<WorkGeometry> {
    tuning.validate()?;
    let rank = domain.len();
    if rank == 0 || rank > 3 {
        return Err(Error::config(format!(
            "unsupported iteration rank {} (expected 1 to 3)",
            rank
        )));
    }

    let base: Vec<u64> = domain
        .iter()
        .map(|d| if thread_override > 0 { thread_override } else { *d })
        .collect();
    if let Some(dim) = base.iter().position(|g| *g == 0) {
        return Err(Error::config(format!("empty iteration domain in dimension {}", dim)));
    }

    match class {
        DeviceClass::Gpu => Ok(gpu_geometry(base, limits, tuning)),
        DeviceClass::Cpu => Ok(cpu_geometry(base, limits, tuning)),
        DeviceClass::Constrained => constrained_geometry(base, tuning),
    }
}

fn gpu_geometry(mut global: Vec<u64>, limits: &DeviceLimits, tuning: &GeometryTuning) -> WorkGeometry {
    if tuning.adjust_irregular {
        for g in global.iter_mut() {
            *g = round_up(*g, tuning.gpu_warp);
        }
    }

    let rank = global.len();
    let local = global
        .iter()
        .enumerate()
        .map(|(dim, g)| {
            let block = match (rank, dim) {
                (1, _) => tuning.gpu_block_x,
                (_, 0) => tuning.gpu_block_2d_x,
                _ => tuning.gpu_block_2d_y,
            };
            largest_divisor(*g, limits.max_work_item_sizes[dim].min(block))
        })
        .collect();

    WorkGeometry { global, local }
}

fn cpu_geometry(global: Vec<u64>, limits: &DeviceLimits, tuning: &GeometryTuning) -> WorkGeometry {
    let local = global
        .iter()
        .enumerate()
        .map(|(dim, g)| largest_divisor(*g, limits.max_work_item_sizes[dim].min(tuning.cpu_block)))
        .collect();

    WorkGeometry { global, local }
}

fn constrained_geometry(global: Vec<u64>, tuning: &GeometryTuning) -> Result<WorkGeometry> {
    let global: Vec<u64> = global
        .into_iter()
        .map(|g| round_up(g, tuning.fpga_warp))
        .collect();

    let mut local = Vec::with_capacity(global.len());
    for g in &global {
        let mut value = tuning.fpga_local_work.min(*g);
        while g % value != 0 {
            value -= 1;
        }
        if value < tuning.fpga_local_work {
            return Err(Error::config(format!(
                "minimum input of {} elements per dimension required on a constrained device (global size {})",
                tuning.fpga_local_work, g
            )));
        }
        local.push(value);
    }

    Ok(WorkGeometry { global, local })
}

/// Largest divisor of `global` that does not exceed `cap`, found by counting
/// down. A cap equal to the global size is halved first so a single group
/// never covers the whole range.
pub fn largest_divisor(global: u64, cap: u64) -> u64 {
    let cap = if cap == global { cap / 2 } else { cap };
    let mut value = cap.min(global).max(1);
    while global % value != 0 {
        value -= 1;
    }
    value
}

fn round_up(value: u64, multiple: u64) -> u64 {
    if value % multiple == 0 {
        value
    } else {
        (value / multiple + 1) * multiple
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits(class: DeviceClass) -> DeviceLimits {
        DeviceLimits {
            class,
            ..DeviceLimits::default()
        }
    }

    #[test]
    fn test_gpu_one_dimension() {
        let tuning = GeometryTuning::default();
        let geometry =
            compute_launch_geometry(DeviceClass::Gpu, &[1024], 0, &limits(DeviceClass::Gpu), &tuning).unwrap();
        assert_eq!(geometry.global, vec![1024]);
        assert_eq!(geometry.local, vec![256]);
    }

    #[test]
    fn test_gpu_two_dimensions_use_2d_blocks() {
        let tuning = GeometryTuning::default();
        let geometry =
            compute_launch_geometry(DeviceClass::Gpu, &[64, 30], 0, &limits(DeviceClass::Gpu), &tuning).unwrap();
        assert_eq!(geometry.local, vec![4, 3]);
    }

    #[test]
    fn test_prime_size_gets_unit_local() {
        let tuning = GeometryTuning::default();
        let geometry =
            compute_launch_geometry(DeviceClass::Gpu, &[1021], 0, &limits(DeviceClass::Gpu), &tuning).unwrap();
        assert_eq!(geometry.local, vec![1]);
    }

    #[test]
    fn test_zero_tunables_are_rejected() {
        let limits = limits(DeviceClass::Constrained);
        for tuning in [
            GeometryTuning { fpga_warp: 0, ..GeometryTuning::default() },
            GeometryTuning { fpga_local_work: 0, ..GeometryTuning::default() },
            GeometryTuning { gpu_warp: 0, adjust_irregular: true, ..GeometryTuning::default() },
        ] {
            let err = compute_launch_geometry(DeviceClass::Constrained, &[128], 0, &limits, &tuning).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{err}");
            let err = compute_launch_geometry(DeviceClass::Gpu, &[128], 0, &limits, &tuning).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{err}");
        }
    }

    #[test]
    fn test_cap_equal_to_global_is_halved() {
        assert_eq!(largest_divisor(256, 256), 128);
        assert_eq!(largest_divisor(1, 1), 1);
        assert_eq!(largest_divisor(12, 5), 4);
    }

    #[test]
    fn test_thread_override() {
        let tuning = GeometryTuning::default();
        let geometry =
            compute_launch_geometry(DeviceClass::Gpu, &[1024], 512, &limits(DeviceClass::Gpu), &tuning).unwrap();
        assert_eq!(geometry.global, vec![512]);
    }

    #[test]
    fn test_adjust_irregular_rounds_to_warp() {
        let tuning = GeometryTuning {
            adjust_irregular: true,
            ..GeometryTuning::default()
        };
        let geometry =
            compute_launch_geometry(DeviceClass::Gpu, &[1000], 0, &limits(DeviceClass::Gpu), &tuning).unwrap();
        assert_eq!(geometry.global, vec![1024]);
    }

    #[test]
    fn test_cpu_uses_cpu_block() {
        let tuning = GeometryTuning::default();
        let geometry =
            compute_launch_geometry(DeviceClass::Cpu, &[1024], 0, &limits(DeviceClass::Cpu), &tuning).unwrap();
        assert_eq!(geometry.local, vec![128]);
    }

    #[test]
    fn test_constrained_rounds_and_fixes_local() {
        let tuning = GeometryTuning::default();
        let geometry = compute_launch_geometry(
            DeviceClass::Constrained,
            &[100],
            0,
            &limits(DeviceClass::Constrained),
            &tuning,
        )
        .unwrap();
        assert_eq!(geometry.global, vec![128]);
        assert_eq!(geometry.local, vec![64]);
    }

    #[test]
    fn test_constrained_rejects_small_input() {
        let tuning = GeometryTuning::default();
        let err = compute_launch_geometry(
            DeviceClass::Constrained,
            &[16],
            0,
            &limits(DeviceClass::Constrained),
            &tuning,
        )
        .unwrap_err();
        assert!(err.to_string().contains("minimum input of 64 elements"));
    }

    #[test]
    fn test_invalid_rank() {
        let tuning = GeometryTuning::default();
        for domain in [&[][..], &[2, 2, 2, 2][..]] {
            for class in [DeviceClass::Gpu, DeviceClass::Cpu, DeviceClass::Constrained] {
                let err = compute_launch_geometry(class, domain, 0, &limits(class), &tuning).unwrap_err();
                assert!(matches!(err, Error::Config(_)));
            }
        }
    }

    proptest! {
        #[test]
        fn prop_divisor_search(global in 1u64..100_000, cap in 1u64..2048) {
            let local = largest_divisor(global, cap);
            prop_assert_eq!(global % local, 0);
            prop_assert!(local >= 1);
            prop_assert!(local <= cap.max(1));
        }

        #[test]
        fn prop_constrained_geometry(size in 64u64..1_000_000) {
            let tuning = GeometryTuning::default();
            let limits = limits(DeviceClass::Constrained);
            match compute_launch_geometry(DeviceClass::Constrained, &[size], 0, &limits, &tuning) {
                Ok(geometry) => {
                    let g = geometry.global[0];
                    prop_assert!(g >= size);
                    prop_assert_eq!(g % 32, 0);
                    prop_assert!(g < size + 32);
                    prop_assert_eq!(geometry.local[0], 64);
                }
                Err(err) => prop_assert!(matches!(err, Error::Config(_))),
            }
        }

        #[test]
        fn prop_gpu_local_divides_global(d0 in 1u64..4096, d1 in 1u64..512) {
            let tuning = GeometryTuning::default();
            let limits = limits(DeviceClass::Gpu);
            let geometry = compute_launch_geometry(DeviceClass::Gpu, &[d0, d1], 0, &limits, &tuning).unwrap();
            for (g, l) in geometry.global.iter().zip(&geometry.local) {
                prop_assert_eq!(g % l, 0);
            }
        }
    }
}
