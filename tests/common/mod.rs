//! Shared fixtures for the integration tests
//!
//! - synthetic checkpoints written to temp files
//! - seeded random weights
//! - a straight-line reference decoder to compare the pipeline against
//! - an optional Level Zero fixture, present only when a device and a
//!   kernel module are both available

#![allow(dead_code)]

use std::path::PathBuf;

use anyhow::Context;
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use zeforge::backend::ZeRuntime;
use zeforge::model::save_checkpoint;
use zeforge::{BackendConfig, ModelParameters, RawWeights};

pub use serial_test::serial;

/// Environment variable naming the kernel module used by the GPU tests
pub const TEST_KERNELS_ENV: &str = "ZEFORGE_TEST_KERNELS";

/// Level Zero configuration for tests that need a device.
///
/// `None` when no loader or device is present, or when
/// `ZEFORGE_TEST_KERNELS` is unset; tests skip in that case.
pub static GPU_FIXTURE: Lazy<Option<GpuTestFixture>> = Lazy::new(|| {
    let _ = zeforge::logging::init_logging_from_env();
    if !ZeRuntime::is_available() {
        eprintln!("WARNING: no Level Zero device - skipping GPU tests");
        return None;
    }
    let Some(kernels) = std::env::var_os(TEST_KERNELS_ENV).map(PathBuf::from) else {
        eprintln!("WARNING: {} not set - skipping GPU tests", TEST_KERNELS_ENV);
        return None;
    };
    let config = BackendConfig::level_zero(kernels);
    match ZeRuntime::shared(&config) {
        Ok(runtime) => {
            eprintln!("GPU test fixture initialized on {}", runtime.device_info());
            Some(GpuTestFixture { config })
        }
        Err(e) => {
            eprintln!("ERROR: failed to initialize Level Zero runtime: {}", e);
            None
        }
    }
});

pub struct GpuTestFixture {
    config: BackendConfig,
}

impl GpuTestFixture {
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

/// Small GQA model: 4 query heads over 2 key/value heads
pub fn small_params() -> ModelParameters {
    ModelParameters::new(16, 40, 2, 4, 2, 24, 8, true).expect("valid parameters")
}

/// Weights drawn uniformly from `[-0.5, 0.5)`, norms from `[0.5, 1.5)`
pub fn random_weights(params: &ModelParameters, seed: u64) -> RawWeights {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    RawWeights::from_fn(params, |name, _| match name {
        "rms_att" | "rms_ffn" | "rms_final" => rng.gen_range(0.5..1.5),
        _ => rng.gen_range(-0.5..0.5),
    })
}

/// Write a checkpoint into a fresh temp dir; keep the dir alive while the
/// path is in use.
pub fn write_temp_checkpoint(
    params: &ModelParameters,
    raw: &RawWeights,
) -> anyhow::Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir().context("Failed to create temporary directory for test")?;
    let path = dir.path().join("model.bin");
    save_checkpoint(&path, params, raw).context("Failed to write test checkpoint")?;
    Ok((dir, path))
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Naive single-threaded decoder with its own KV history.
///
/// Written without any of the crate's kernels so it can serve as an oracle.
pub struct ReferenceDecoder<'a> {
    p: ModelParameters,
    w: &'a RawWeights,
    keys: Vec<Vec<Vec<f32>>>,
    values: Vec<Vec<Vec<f32>>>,
}

impl<'a> ReferenceDecoder<'a> {
    pub fn new(p: ModelParameters, w: &'a RawWeights) -> Self {
        Self {
            p,
            w,
            keys: vec![Vec::new(); p.n_layers],
            values: vec![Vec::new(); p.n_layers],
        }
    }

    /// Tokens must arrive at consecutive positions starting from 0.
    pub fn step(&mut self, token: usize) -> Vec<f32> {
        let p = self.p;
        let dim = p.dim;
        let hidden = p.hidden_dim;
        let hs = dim / p.n_heads;
        let kv_dim = hs * p.n_kv_heads;
        let kv_mul = p.n_heads / p.n_kv_heads;
        let pos = self.keys[0].len();

        let mut x = self.w.token_embedding[token * dim..(token + 1) * dim].to_vec();
        for l in 0..p.n_layers {
            let xb = rmsnorm(&x, &self.w.rms_att[l * dim..(l + 1) * dim]);
            let mut q = project(&self.w.wq[l * dim * dim..], &xb, dim);
            let mut k = project(&self.w.wk[l * kv_dim * dim..], &xb, kv_dim);
            let v = project(&self.w.wv[l * kv_dim * dim..], &xb, kv_dim);

            for i in (0..dim).step_by(2) {
                let freq = 1.0 / 10000f64.powf((i % hs) as f64 / hs as f64);
                let angle = pos as f64 * freq;
                let (sin, cos) = angle.sin_cos();
                rotate(&mut q, i, cos as f32, sin as f32);
                if i < kv_dim {
                    rotate(&mut k, i, cos as f32, sin as f32);
                }
            }
            self.keys[l].push(k);
            self.values[l].push(v);

            let mut attn = vec![0.0f32; dim];
            for h in 0..p.n_heads {
                let qh = &q[h * hs..(h + 1) * hs];
                let off = (h / kv_mul) * hs;
                let mut scores: Vec<f32> = self.keys[l]
                    .iter()
                    .map(|kt| {
                        let dot: f32 = qh.iter().zip(&kt[off..off + hs]).map(|(a, b)| a * b).sum();
                        dot / (hs as f32).sqrt()
                    })
                    .collect();
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = scores.iter_mut().map(|s| {
                    *s = (*s - max).exp();
                    *s
                }).sum();
                for (t, s) in scores.iter().enumerate() {
                    let vt = &self.values[l][t][off..off + hs];
                    for i in 0..hs {
                        attn[h * hs + i] += s / sum * vt[i];
                    }
                }
            }
            let o = project(&self.w.wo[l * dim * dim..], &attn, dim);
            x.iter_mut().zip(&o).for_each(|(a, b)| *a += b);

            let xb = rmsnorm(&x, &self.w.rms_ffn[l * dim..(l + 1) * dim]);
            let h1 = project(&self.w.w1[l * hidden * dim..], &xb, hidden);
            let h3 = project(&self.w.w3[l * hidden * dim..], &xb, hidden);
            let gated: Vec<f32> = h1
                .iter()
                .zip(&h3)
                .map(|(&a, &b)| a / (1.0 + (-a).exp()) * b)
                .collect();
            let down = project(&self.w.w2[l * dim * hidden..], &gated, dim);
            x.iter_mut().zip(&down).for_each(|(a, b)| *a += b);
        }

        let x = rmsnorm(&x, &self.w.rms_final);
        let classifier = self.w.classifier.as_deref().unwrap_or(&self.w.token_embedding);
        project(classifier, &x, p.vocab_size)
    }
}

fn rmsnorm(x: &[f32], weight: &[f32]) -> Vec<f32> {
    let ms = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let scale = 1.0 / (ms + 1e-5).sqrt();
    x.iter().zip(weight).map(|(v, w)| w * v * scale).collect()
}

fn project(w: &[f32], x: &[f32], rows: usize) -> Vec<f32> {
    let n = x.len();
    (0..rows)
        .map(|r| w[r * n..(r + 1) * n].iter().zip(x).map(|(a, b)| a * b).sum())
        .collect()
}

fn rotate(v: &mut [f32], i: usize, cos: f32, sin: f32) {
    let (a, b) = (v[i], v[i + 1]);
    v[i] = a * cos - b * sin;
    v[i + 1] = a * sin + b * cos;
}
