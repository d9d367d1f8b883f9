//! Launch geometry tests through the full runtime.

use tgtrt_core::device::{HARD_TEAM_LIMIT, HARD_THREAD_LIMIT};
use tgtrt_core::prelude::*;
use tgtrt_core::sim::{cuda_elf_stub, SimDevice, SimDriver, SimFunction, SimModuleSpec};
use tgtrt_core::{HardwareLimits, RuntimeConfigBuilder};

struct Fixture {
    runtime: OffloadRuntime<SimDriver>,
    spmd: KernelHandle,
    generic: KernelHandle,
    limited: KernelHandle,
}

fn fixture(config: RuntimeConfig) -> Fixture {
    let driver = SimDriver::with_devices(1);
    let bytes = cuda_elf_stub("geometry");
    driver.register_image(
        &bytes,
        SimModuleSpec::new()
            .with_kernel(SimFunction::new("spmd"), 0)
            .with_kernel(SimFunction::new("generic"), 1)
            .with_kernel(SimFunction::new("limited").with_max_threads(512), 1),
    );

    let runtime = OffloadRuntime::new(driver, config);
    runtime.init_device(0).unwrap();
    let table = runtime
        .load_binary(
            0,
            &DeviceImage::new(
                bytes,
                vec![
                    OffloadEntry::kernel("spmd", 1),
                    OffloadEntry::kernel("generic", 2),
                    OffloadEntry::kernel("limited", 3),
                ],
            ),
        )
        .unwrap();

    Fixture {
        spmd: table.kernel("spmd").unwrap(),
        generic: table.kernel("generic").unwrap(),
        limited: table.kernel("limited").unwrap(),
        runtime,
    }
}

#[test]
fn test_trip_count_precedence() {
    let f = fixture(RuntimeConfig::default());
    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 0, 0, 2049).unwrap();
    assert_eq!(geometry, LaunchGeometry { blocks: 3, threads: 1024 });

    let f = fixture(RuntimeConfigBuilder::new().with_num_teams(40).build());
    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 0, 0, 2049).unwrap();
    assert_eq!(geometry.blocks, 40);
}

#[test]
fn test_explicit_team_clamp() {
    let f = fixture(RuntimeConfig::default());
    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 99_999, 0, 0).unwrap();
    assert_eq!(geometry.blocks, 65_536);

    let f = fixture(RuntimeConfigBuilder::new().with_team_limit(1000).build());
    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 99_999, 0, 0).unwrap();
    assert_eq!(geometry.blocks, 1000);
}

#[test]
fn test_trip_count_clamped_to_team_limit() {
    let overrides = EnvOverrides::from_lookup(|key| match key {
        "OMP_TEAM_LIMIT" => Some("64".to_string()),
        _ => None,
    });
    let f = fixture(RuntimeConfigBuilder::new().with_overrides(overrides).build());
    assert_eq!(f.runtime.capabilities(0).unwrap().blocks_per_grid, 64);

    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 0, 0, 1 << 30).unwrap();
    assert_eq!(geometry.blocks, 64);
    assert_eq!(geometry.threads, 1024);

    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 0, 0, 5 * 1024).unwrap();
    assert_eq!(geometry.blocks, 5);
}

#[test]
fn test_generic_inflation_and_kernel_limit() {
    let f = fixture(RuntimeConfig::default());
    let geometry = f.runtime.run_team_region(0, f.generic, &[], 1, 992, 0).unwrap();
    assert_eq!(geometry.threads, 1024);

    let geometry = f.runtime.run_team_region(0, f.limited, &[], 1, 992, 0).unwrap();
    assert_eq!(geometry.threads, 512);
}

#[test]
fn test_run_region_uses_single_team() {
    let f = fixture(RuntimeConfig::default());
    let geometry = f.runtime.run_region(0, f.spmd, &[7]).unwrap();
    assert_eq!(geometry, LaunchGeometry { blocks: 1, threads: 1024 });

    // Generic mode without a thread limit: default + warp, clamped.
    let geometry = f.runtime.run_region(0, f.generic, &[]).unwrap();
    assert_eq!(geometry.threads, 1024);
}

#[test]
fn test_plan_is_deterministic_through_runtime() {
    let f = fixture(RuntimeConfig::default());
    let request = LaunchRequest::new(0, 300, 123_456);
    let first = f.runtime.plan_launch(0, f.limited, &request).unwrap();
    for _ in 0..10 {
        assert_eq!(f.runtime.plan_launch(0, f.limited, &request).unwrap(), first);
    }
    assert_eq!(first.threads, 332);
}

#[test]
fn test_launch_never_exceeds_ceilings() {
    let f = fixture(RuntimeConfigBuilder::new().with_team_limit(4096).build());
    let caps = f.runtime.capabilities(0).unwrap();

    for kernel in [f.spmd, f.generic, f.limited] {
        for teams in [-1, 0, 1, 4095, 4096, 4097, i32::MAX] {
            for threads in [0, 1, 31, 1000, 1024, 5000] {
                for trip_count in [0, 1, 1 << 20, 1 << 40, u64::MAX] {
                    let request = LaunchRequest::new(teams, threads, trip_count);
                    let geometry = f.runtime.plan_launch(0, kernel, &request).unwrap();
                    assert!(geometry.blocks <= caps.blocks_per_grid);
                    assert!(geometry.threads <= caps.threads_per_block);
                    if kernel == f.limited {
                        assert!(geometry.threads <= 512);
                    }
                }
            }
        }
    }
}

#[test]
fn test_capability_bounds_after_init() {
    let cases = [
        HardwareLimits::typical(),
        HardwareLimits {
            max_grid_dim_x: 65_535,
            max_block_dim_x: 512,
            max_threads_per_block: 1024,
            warp_size: 32,
        },
        HardwareLimits {
            max_grid_dim_x: 64,
            max_block_dim_x: 2048,
            max_threads_per_block: 2048,
            warp_size: 64,
        },
    ];

    let mut builder = SimDriver::builder();
    for limits in cases {
        builder = builder.device(SimDevice::with_limits(limits));
    }
    builder = builder.device(SimDevice::without_limits());
    let driver = builder.build();

    let runtime = OffloadRuntime::new(driver, RuntimeConfig::default());
    assert_eq!(runtime.device_count(), 4);

    for id in 0..runtime.device_count() {
        let caps = runtime.init_device(id).unwrap();
        assert!(caps.threads_per_block >= 1 && caps.threads_per_block <= HARD_THREAD_LIMIT);
        assert!(caps.blocks_per_grid >= 1 && caps.blocks_per_grid <= HARD_TEAM_LIMIT);
        assert!(caps.default_teams <= caps.blocks_per_grid);
        assert!(caps.default_threads <= caps.threads_per_block);
    }

    assert_eq!(runtime.capabilities(1).unwrap().threads_per_block, 512);
    assert_eq!(runtime.capabilities(2).unwrap().blocks_per_grid, 64);
    assert_eq!(runtime.capabilities(2).unwrap().default_teams, 64);
    assert_eq!(runtime.capabilities(3).unwrap().blocks_per_grid, 128);
}

#[test]
fn test_env_overrides_read_once_at_construction() {
    let overrides = EnvOverrides::from_lookup(|key| match key {
        "OMP_TEAM_LIMIT" => Some("256".to_string()),
        "OMP_NUM_TEAMS" => Some("512".to_string()),
        _ => None,
    });
    let f = fixture(RuntimeConfigBuilder::new().with_overrides(overrides).build());

    let caps = f.runtime.capabilities(0).unwrap();
    assert_eq!(caps.blocks_per_grid, 256);
    assert_eq!(caps.default_teams, 256);

    // Default teams, not the trip count, since OMP_NUM_TEAMS is set.
    let geometry = f.runtime.run_team_region(0, f.spmd, &[], 0, 0, 10).unwrap();
    assert_eq!(geometry.blocks, 256);
}
