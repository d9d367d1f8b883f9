//! Fuzz target for launch geometry planning.
//!
//! Checks the geometry invariants for arbitrary device limits, overrides
//! and requests.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tgtrt_core::planner::plan;
use tgtrt_core::{DeviceCapabilities, EnvOverrides, ExecMode, HardwareLimits, LaunchRequest};

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    grid: u32,
    block: u32,
    warp: u8,
    team_limit: Option<u32>,
    num_teams: Option<u32>,
    generic: bool,
    kernel_limit: Option<u32>,
    teams: i32,
    thread_limit: i32,
    trip_count: u64,
}

fuzz_target!(|input: FuzzInput| {
    let limits = HardwareLimits {
        max_grid_dim_x: input.grid.max(1),
        max_block_dim_x: input.block.max(1),
        max_threads_per_block: input.block.max(1),
        warp_size: u32::from(input.warp),
    };
    let overrides = EnvOverrides {
        team_limit: input.team_limit,
        num_teams: input.num_teams,
    };
    let caps = DeviceCapabilities::derive(Some(&limits), &overrides);
    let mode = if input.generic { ExecMode::Generic } else { ExecMode::Spmd };
    let kernel_limit = input.kernel_limit.filter(|&limit| limit > 0);
    let request = LaunchRequest::new(input.teams, input.thread_limit, input.trip_count);

    let geometry = plan(&caps, &overrides, mode, kernel_limit, &request);
    assert_eq!(geometry, plan(&caps, &overrides, mode, kernel_limit, &request));

    assert!(geometry.threads <= caps.threads_per_block);
    if let Some(limit) = kernel_limit {
        assert!(geometry.threads <= limit);
    }
    assert!(geometry.blocks <= caps.blocks_per_grid);
});
