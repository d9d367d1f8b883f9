//! Launch geometry planning.
//!
//! [`plan`] is a pure function of device capabilities, overrides, the
//! kernel's execution mode and hardware thread limit, and the per-call
//! request. It never touches the driver.
//!
//! Threads are derived first since the trip-count branch of block
//! derivation divides by the final thread count.

use serde::{Deserialize, Serialize};

use crate::config::EnvOverrides;
use crate::device::DeviceCapabilities;
use crate::kernel::ExecMode;

/// Per-call launch hints from the host orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Requested team count; `<= 0` lets the planner choose.
    pub teams: i32,
    /// Requested threads per team; `<= 0` uses the device default.
    pub thread_limit: i32,
    /// Loop trip count of the offloaded region; 0 when unknown.
    pub trip_count: u64,
}

impl LaunchRequest {
    /// Create a request.
    #[must_use]
    pub const fn new(teams: i32, thread_limit: i32, trip_count: u64) -> Self {
        Self {
            teams,
            thread_limit,
            trip_count,
        }
    }

    /// Single-team request used by non-teams regions.
    #[must_use]
    pub const fn single() -> Self {
        Self::new(1, 0, 0)
    }
}

/// Final grid/block geometry (x dimension only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchGeometry {
    /// Blocks per grid (teams).
    pub blocks: u32,
    /// Threads per block.
    pub threads: u32,
}

impl LaunchGeometry {
    /// Total threads launched.
    #[must_use]
    pub fn total_threads(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.threads)
    }
}

/// Derive the launch geometry for one dispatch.
///
/// `kernel_limit` is the kernel's hardware max threads per block, or `None`
/// when the query failed.
#[must_use]
pub fn plan(
    caps: &DeviceCapabilities,
    overrides: &EnvOverrides,
    mode: ExecMode,
    kernel_limit: Option<u32>,
    request: &LaunchRequest,
) -> LaunchGeometry {
    let threads = plan_threads(caps, mode, kernel_limit, request.thread_limit);
    let blocks = plan_blocks(caps, overrides, threads, request);

    LaunchGeometry { blocks, threads }
}

fn plan_threads(
    caps: &DeviceCapabilities,
    mode: ExecMode,
    kernel_limit: Option<u32>,
    thread_limit: i32,
) -> u32 {
    let mut threads = if thread_limit > 0 {
        tracing::debug!("Setting CUDA threads per block to requested {}", thread_limit);
        thread_limit as u32
    } else {
        tracing::debug!("Setting CUDA threads per block to default {}", caps.default_threads);
        caps.default_threads
    };

    if mode == ExecMode::Generic {
        // The extra warp runs the master thread.
        threads = threads.saturating_add(caps.warp_size);
        tracing::debug!("Adding master warp: +{} threads", caps.warp_size);
    }

    if threads > caps.threads_per_block {
        threads = caps.threads_per_block;
        tracing::debug!("Threads per block capped at device limit {}", caps.threads_per_block);
    }

    if let Some(limit) = kernel_limit {
        if threads > limit {
            threads = limit;
            tracing::debug!("Threads per block capped at kernel limit {}", limit);
        }
    }

    threads
}

fn plan_blocks(
    caps: &DeviceCapabilities,
    overrides: &EnvOverrides,
    threads: u32,
    request: &LaunchRequest,
) -> u32 {
    if request.teams <= 0 {
        if request.trip_count > 0 && !overrides.pins_team_count() {
            let per_block = u64::from(threads.max(1));
            let blocks = ((request.trip_count - 1) / per_block) + 1;
            let blocks = u32::try_from(blocks).unwrap_or(u32::MAX);
            tracing::debug!(
                "Using {} teams due to loop trip count {} and number of threads per block {}",
                blocks,
                request.trip_count,
                threads
            );
            if blocks > caps.blocks_per_grid {
                tracing::debug!("Capping number of teams to team limit {}", caps.blocks_per_grid);
                caps.blocks_per_grid
            } else {
                blocks
            }
        } else {
            tracing::debug!("Using default number of teams {}", caps.default_teams);
            caps.default_teams
        }
    } else if request.teams as u32 > caps.blocks_per_grid {
        tracing::debug!("Capping number of teams to team limit {}", caps.blocks_per_grid);
        caps.blocks_per_grid
    } else {
        tracing::debug!("Using requested number of teams {}", request.teams);
        request.teams as u32
    }
}
