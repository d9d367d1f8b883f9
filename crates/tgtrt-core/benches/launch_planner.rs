//! Launch planner benchmarks.
//!
//! The planner runs on every dispatch; these measure the pure computation
//! and the full plan path through the runtime (context bind + cached
//! kernel limit) against the simulated driver.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tgtrt_core::planner::plan;
use tgtrt_core::prelude::*;
use tgtrt_core::sim::{cuda_elf_stub, SimDriver, SimFunction, SimModuleSpec};
use tgtrt_core::{DeviceCapabilities, HardwareLimits};

/// Benchmark the pure planner across request shapes
fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner/plan");
    let overrides = EnvOverrides::none();
    let caps = DeviceCapabilities::derive(Some(&HardwareLimits::typical()), &overrides);

    let requests = [
        ("single", LaunchRequest::single()),
        ("explicit_teams", LaunchRequest::new(99_999, 256, 0)),
        ("trip_count", LaunchRequest::new(0, 0, 1 << 24)),
    ];

    for (name, request) in requests {
        for mode in [ExecMode::Spmd, ExecMode::Generic] {
            group.bench_with_input(BenchmarkId::new(name, mode), &request, |b, request| {
                b.iter(|| {
                    let geometry = plan(
                        black_box(&caps),
                        black_box(&overrides),
                        mode,
                        Some(512),
                        black_box(request),
                    );
                    black_box(geometry);
                });
            });
        }
    }

    group.finish();
}

/// Benchmark capability derivation
fn bench_derive(c: &mut Criterion) {
    let overrides = EnvOverrides::none().with_team_limit(4096).with_num_teams(256);
    let limits = HardwareLimits::typical();

    c.bench_function("planner/derive_capabilities", |b| {
        b.iter(|| {
            let caps = DeviceCapabilities::derive(black_box(Some(&limits)), black_box(&overrides));
            black_box(caps);
        });
    });
}

/// Benchmark planning through the runtime
fn bench_runtime_plan(c: &mut Criterion) {
    let driver = SimDriver::with_devices(1);
    let bytes = cuda_elf_stub("bench");
    driver.register_image(&bytes, SimModuleSpec::new().with_kernel(SimFunction::new("k"), 1));

    let runtime = OffloadRuntime::new(driver, RuntimeConfig::default());
    runtime.init_device(0).expect("init device");
    let table = runtime
        .load_binary(0, &DeviceImage::new(bytes, vec![OffloadEntry::kernel("k", 1)]))
        .expect("load image");
    let kernel = table.kernel("k").expect("kernel entry");
    let request = LaunchRequest::new(0, 0, 1 << 20);

    c.bench_function("planner/runtime_plan_launch", |b| {
        b.iter(|| {
            let geometry = runtime
                .plan_launch(0, black_box(kernel), black_box(&request))
                .expect("plan");
            black_box(geometry);
        });
    });
}

criterion_group!(benches, bench_plan, bench_derive, bench_runtime_plan);
criterion_main!(benches);
