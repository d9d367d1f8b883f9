//! Device capabilities and their derivation from hardware limits.

use serde::{Deserialize, Serialize};

use crate::config::EnvOverrides;

/// Library-imposed ceiling on blocks per grid (64k).
pub const HARD_TEAM_LIMIT: u32 = 1 << 16;

/// Library-imposed ceiling on threads per block.
pub const HARD_THREAD_LIMIT: u32 = 1024;

/// Default team count when no override is given.
pub const DEFAULT_NUM_TEAMS: u32 = 128;

/// Default thread count per team.
pub const DEFAULT_NUM_THREADS: u32 = 1024;

/// Warp size assumed when the hardware cannot be queried.
pub const DEFAULT_WARP_SIZE: u32 = 32;

/// Raw limits reported by the driver for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareLimits {
    /// Max grid dimension along x.
    pub max_grid_dim_x: u32,
    /// Max block dimension along x.
    pub max_block_dim_x: u32,
    /// Max threads per block across all dimensions.
    pub max_threads_per_block: u32,
    /// Warp size.
    pub warp_size: u32,
}

impl HardwareLimits {
    /// Limits of a typical recent NVIDIA GPU.
    #[must_use]
    pub fn typical() -> Self {
        Self {
            max_grid_dim_x: i32::MAX as u32,
            max_block_dim_x: 1024,
            max_threads_per_block: 1024,
            warp_size: 32,
        }
    }
}

/// Launch-relevant capabilities of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Ceiling for blocks per grid (teams).
    pub blocks_per_grid: u32,
    /// Ceiling for threads per block.
    pub threads_per_block: u32,
    /// Warp size.
    pub warp_size: u32,
    /// Team count used when a launch does not request one.
    pub default_teams: u32,
    /// Thread count used when a launch does not request one.
    pub default_threads: u32,
}

impl DeviceCapabilities {
    /// Derive capabilities from the hardware query result and overrides.
    ///
    /// `hardware` is `None` when the query failed; fixed defaults are used
    /// instead of failing device initialization.
    #[must_use]
    pub fn derive(hardware: Option<&HardwareLimits>, overrides: &EnvOverrides) -> Self {
        let (mut blocks_per_grid, threads_per_block, warp_size) = match hardware {
            Some(hw) => {
                let blocks = if hw.max_grid_dim_x <= HARD_TEAM_LIMIT {
                    tracing::debug!("Using {} blocks per grid", hw.max_grid_dim_x);
                    hw.max_grid_dim_x
                } else {
                    tracing::debug!(
                        "Max blocks per grid {} exceeds the hard team limit {}, capping at the hard limit",
                        hw.max_grid_dim_x,
                        HARD_TEAM_LIMIT
                    );
                    HARD_TEAM_LIMIT
                };

                // Only the x dimension is used for threads.
                let threads = if hw.max_block_dim_x <= HARD_THREAD_LIMIT {
                    tracing::debug!("Using {} threads per block", hw.max_block_dim_x);
                    if hw.max_block_dim_x < hw.max_threads_per_block {
                        tracing::debug!(
                            "(fewer than max per block along all xyz dims {})",
                            hw.max_threads_per_block
                        );
                    }
                    hw.max_block_dim_x
                } else {
                    tracing::debug!(
                        "Max threads per block {} exceeds the hard thread limit {}, capping at the hard limit",
                        hw.max_block_dim_x,
                        HARD_THREAD_LIMIT
                    );
                    HARD_THREAD_LIMIT
                };

                (blocks, threads, hw.warp_size)
            }
            None => {
                tracing::warn!("Device properties unavailable, using defaults");
                (DEFAULT_NUM_TEAMS, DEFAULT_NUM_THREADS, DEFAULT_WARP_SIZE)
            }
        };

        if let Some(limit) = overrides.effective_team_limit() {
            if blocks_per_grid > limit {
                blocks_per_grid = limit;
                tracing::debug!("Capping max blocks per grid to OMP_TEAM_LIMIT={}", limit);
            }
        }

        tracing::debug!(
            "Max number of blocks {}, threads {} & warp size {}",
            blocks_per_grid,
            threads_per_block,
            warp_size
        );

        let mut default_teams = match overrides.effective_num_teams() {
            Some(teams) => {
                tracing::debug!("Default number of teams set according to environment {}", teams);
                teams
            }
            None => {
                tracing::debug!(
                    "Default number of teams set according to library's default {}",
                    DEFAULT_NUM_TEAMS
                );
                DEFAULT_NUM_TEAMS
            }
        };
        if default_teams > blocks_per_grid {
            default_teams = blocks_per_grid;
            tracing::debug!(
                "Default number of teams exceeds device limit, capping at {}",
                blocks_per_grid
            );
        }

        let mut default_threads = DEFAULT_NUM_THREADS;
        if default_threads > threads_per_block {
            default_threads = threads_per_block;
            tracing::debug!(
                "Default number of threads exceeds device limit, capping at {}",
                threads_per_block
            );
        }

        Self {
            blocks_per_grid,
            threads_per_block,
            warp_size,
            default_teams,
            default_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(grid: u32, block: u32) -> HardwareLimits {
        HardwareLimits {
            max_grid_dim_x: grid,
            max_block_dim_x: block,
            max_threads_per_block: block,
            warp_size: 32,
        }
    }

    #[test]
    fn test_hard_limits_cap_hardware() {
        let caps = DeviceCapabilities::derive(Some(&HardwareLimits::typical()), &EnvOverrides::none());
        assert_eq!(caps.blocks_per_grid, HARD_TEAM_LIMIT);
        assert_eq!(caps.threads_per_block, HARD_THREAD_LIMIT);
        assert_eq!(caps.warp_size, 32);
        assert_eq!(caps.default_teams, DEFAULT_NUM_TEAMS);
        assert_eq!(caps.default_threads, DEFAULT_NUM_THREADS);
    }

    #[test]
    fn test_small_device_keeps_hardware_values() {
        let caps = DeviceCapabilities::derive(Some(&limits(100, 512)), &EnvOverrides::none());
        assert_eq!(caps.blocks_per_grid, 100);
        assert_eq!(caps.threads_per_block, 512);
        // Defaults are clamped to the device.
        assert_eq!(caps.default_teams, 100);
        assert_eq!(caps.default_threads, 512);
    }

    #[test]
    fn test_query_failure_uses_defaults() {
        let caps = DeviceCapabilities::derive(None, &EnvOverrides::none());
        assert_eq!(caps.blocks_per_grid, DEFAULT_NUM_TEAMS);
        assert_eq!(caps.threads_per_block, DEFAULT_NUM_THREADS);
        assert_eq!(caps.warp_size, DEFAULT_WARP_SIZE);
        assert_eq!(caps.default_teams, DEFAULT_NUM_TEAMS);
    }

    #[test]
    fn test_team_limit_lowers_ceiling_then_default_reclamped() {
        let overrides = EnvOverrides::none().with_team_limit(64).with_num_teams(500);
        let caps = DeviceCapabilities::derive(Some(&HardwareLimits::typical()), &overrides);
        assert_eq!(caps.blocks_per_grid, 64);
        assert_eq!(caps.default_teams, 64);
    }

    #[test]
    fn test_num_teams_override() {
        let overrides = EnvOverrides::none().with_num_teams(300);
        let caps = DeviceCapabilities::derive(Some(&HardwareLimits::typical()), &overrides);
        assert_eq!(caps.blocks_per_grid, HARD_TEAM_LIMIT);
        assert_eq!(caps.default_teams, 300);
    }

    #[test]
    fn test_team_limit_above_ceiling_is_noop() {
        let overrides = EnvOverrides::none().with_team_limit(1_000_000);
        let caps = DeviceCapabilities::derive(Some(&HardwareLimits::typical()), &overrides);
        assert_eq!(caps.blocks_per_grid, HARD_TEAM_LIMIT);
    }

    #[test]
    fn test_thread_clamp_targets_threads_not_teams() {
        let caps = DeviceCapabilities::derive(Some(&limits(4096, 256)), &EnvOverrides::none());
        assert_eq!(caps.default_threads, 256);
        assert_eq!(caps.default_teams, DEFAULT_NUM_TEAMS);
    }

    #[test]
    fn test_bounds_hold_for_range_of_devices() {
        for grid in [1u32, 128, 65_535, 65_536, 65_537, i32::MAX as u32] {
            for block in [1u32, 32, 1024, 2048] {
                let caps = DeviceCapabilities::derive(Some(&limits(grid, block)), &EnvOverrides::none());
                assert!(caps.threads_per_block > 0 && caps.threads_per_block <= HARD_THREAD_LIMIT);
                assert!(caps.blocks_per_grid > 0 && caps.blocks_per_grid <= HARD_TEAM_LIMIT);
                assert!(caps.default_teams <= caps.blocks_per_grid);
                assert!(caps.default_threads <= caps.threads_per_block);
            }
        }
    }
}
