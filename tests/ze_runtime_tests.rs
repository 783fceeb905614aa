//! Level Zero runtime tests
//!
//! These need a GPU, the oneAPI loader and a compiled kernel module named by
//! `ZEFORGE_TEST_KERNELS`. Without them every test prints a skip notice and
//! passes. All tests run serially because they share one device queue.

mod common;

use common::{max_abs_diff, random_weights, serial, small_params, write_temp_checkpoint, GPU_FIXTURE};
use zeforge::backend::ze_backend::{RuntimePhase, ZeRuntime};
use zeforge::backend::{ComputeBackend, CpuBackend, FloatBuffer, KernelFlavor, ZeBackend};
use zeforge::{BackendConfig, Model, Transformer};

macro_rules! require_gpu {
    () => {
        match GPU_FIXTURE.as_ref() {
            Some(fixture) => fixture,
            None => {
                eprintln!("SKIPPED: Level Zero device or test kernels unavailable");
                return;
            }
        }
    };
}

#[test]
#[serial]
fn test_availability_probe_does_not_panic() {
    let _ = ZeRuntime::is_available();
}

#[test]
#[serial]
fn test_shared_buffer_is_zeroed_and_host_writable() {
    let fixture = require_gpu!();
    let backend = ZeBackend::new(fixture.config()).unwrap();
    let mut buf = backend.allocate(1000).unwrap();
    assert_eq!(buf.len(), 1000);
    assert!(buf.as_slice().iter().all(|&v| v == 0.0));

    buf.as_mut_slice()[999] = 4.5;
    assert_eq!(buf.get(999), 4.5);
    assert_eq!(buf.size_bytes(), 4000);
}

#[test]
#[serial]
fn test_classifier_matches_cpu() {
    let fixture = require_gpu!();
    let gpu = ZeBackend::new(fixture.config()).unwrap();
    let cpu = CpuBackend::with_flavor(KernelFlavor::Scalar);

    let (n, d) = (64usize, 256usize);
    let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin()).collect();
    let w: Vec<f32> = (0..n * d).map(|i| ((i % 17) as f32 - 8.0) * 0.01).collect();

    let mut gpu_logits = gpu.allocate(d).unwrap();
    gpu.classify(
        &mut gpu_logits,
        &gpu.allocate_from(&x).unwrap(),
        &gpu.allocate_from(&w).unwrap(),
    )
    .unwrap();

    let mut cpu_logits = cpu.allocate(d).unwrap();
    cpu.classify(
        &mut cpu_logits,
        &cpu.allocate_from(&x).unwrap(),
        &cpu.allocate_from(&w).unwrap(),
    )
    .unwrap();

    assert!(max_abs_diff(gpu_logits.as_slice(), cpu_logits.as_slice()) <= 1e-4);
    assert_eq!(gpu.runtime().phase(), RuntimePhase::Idle);
}

#[test]
#[serial]
fn test_repeat_launches_hit_the_dispatch_cache() {
    let fixture = require_gpu!();
    let gpu = ZeBackend::new(fixture.config()).unwrap();
    let (n, d) = (32usize, 128usize);
    let x = gpu.allocate_from(&vec![1.0; n]).unwrap();
    let w = gpu.allocate_from(&vec![0.5; n * d]).unwrap();
    let mut logits = gpu.allocate(d).unwrap();

    gpu.classify(&mut logits, &x, &w).unwrap();
    let (hits_before, misses_before) = gpu.runtime().dispatch_stats().unwrap();
    for _ in 0..3 {
        gpu.classify(&mut logits, &x, &w).unwrap();
    }
    let (hits_after, misses_after) = gpu.runtime().dispatch_stats().unwrap();

    assert_eq!(misses_after, misses_before);
    assert_eq!(hits_after - hits_before, 3);
    assert!(logits.as_slice().iter().all(|&v| (v - 16.0).abs() < 1e-4));
}

#[test]
#[serial]
fn test_backend_replaced_after_drop_binds_its_own_kernel() {
    let fixture = require_gpu!();
    let (n, d) = (32usize, 128usize);

    let first = ZeBackend::new(fixture.config()).unwrap();
    let runtime = first.runtime().clone();
    let baseline = runtime.bound_kernels().unwrap();
    let x = first.allocate_from(&vec![1.0; n]).unwrap();
    let w = first.allocate_from(&vec![0.5; n * d]).unwrap();
    let mut logits = first.allocate(d).unwrap();
    first.classify(&mut logits, &x, &w).unwrap();
    assert_eq!(runtime.bound_kernels().unwrap(), baseline + 1);
    drop(first);
    assert_eq!(runtime.bound_kernels().unwrap(), baseline);

    // same buffers and op, fresh kernel object
    let second = ZeBackend::new(fixture.config()).unwrap();
    logits.as_mut_slice().fill(0.0);
    second.classify(&mut logits, &x, &w).unwrap();
    assert!(logits.as_slice().iter().all(|&v| (v - 16.0).abs() < 1e-4));
}

#[test]
#[serial]
fn test_mismatched_classifier_is_rejected_before_launch() {
    let fixture = require_gpu!();
    let gpu = ZeBackend::new(fixture.config()).unwrap();
    let x = gpu.allocate(8).unwrap();
    let w = gpu.allocate(8 * 3).unwrap();
    let mut logits = gpu.allocate(4).unwrap();
    assert!(gpu.classify(&mut logits, &x, &w).is_err());
}

#[test]
#[serial]
fn test_decode_matches_cpu_backend() {
    let fixture = require_gpu!();
    let params = small_params();
    let raw = random_weights(&params, 42);

    let mut gpu = Transformer::from_raw(
        ZeBackend::new(fixture.config()).unwrap(),
        params,
        &raw,
        Some(2),
    )
    .unwrap();
    let mut cpu =
        Transformer::from_raw(CpuBackend::with_flavor(KernelFlavor::Scalar), params, &raw, Some(2))
            .unwrap();

    for (pos, token) in [5usize, 1, 19, 7].into_iter().enumerate() {
        let a = gpu.forward(token, pos).unwrap().to_vec();
        let b = cpu.forward(token, pos).unwrap().to_vec();
        let diff = max_abs_diff(&a, &b);
        assert!(diff <= 1e-4, "position {}: max diff {}", pos, diff);
    }
}

#[test]
#[serial]
fn test_model_load_on_level_zero() {
    let fixture = require_gpu!();
    let params = small_params();
    let raw = random_weights(&params, 8);
    let (_dir, path) = write_temp_checkpoint(&params, &raw).unwrap();

    let config: BackendConfig = fixture.config().clone();
    let mut model = Model::load(&path, &config).unwrap();
    assert_eq!(model.backend_name(), "level-zero");
    let logits = model.forward(3, 0).unwrap();
    assert_eq!(logits.len(), params.vocab_size);
    assert!(logits.iter().all(|v| v.is_finite()));
}
