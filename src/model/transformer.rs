//! Single-token decode pipeline
//!
//! [`Transformer::forward`] runs embed → `n_layers` × (attention, FFN) →
//! final norm → classifier for one token at one position. Every stage except
//! the classifier runs on the CPU kernels inside the model's rayon pool; the
//! classifier goes through the backend so the Level Zero path can offload it.

use std::path::Path;
use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::backend::config::{BackendConfig, BackendKind};
use crate::backend::cpu::ops::{self, HeadLayout};
use crate::backend::{ComputeBackend, CpuBackend, FloatBuffer, ZeBackend};
use crate::error::{ForgeResult, ZeForgeError};
use crate::model::checkpoint::Checkpoint;
use crate::model::config::ModelParameters;
use crate::model::state::DecodeState;
use crate::model::weights::{RawWeights, WeightSet};

pub struct Transformer<B: ComputeBackend> {
    params: ModelParameters,
    weights: WeightSet<B>,
    state: DecodeState<B>,
    backend: B,
    pool: ThreadPool,
}

impl<B: ComputeBackend> Transformer<B> {
    /// `num_threads` of `None` sizes the pool the way rayon does by default.
    pub fn new(
        backend: B,
        params: ModelParameters,
        weights: WeightSet<B>,
        num_threads: Option<usize>,
    ) -> ForgeResult<Self> {
        let state = DecodeState::new(&backend, &params)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.unwrap_or(0))
            .thread_name(|i| format!("zeforge-worker-{}", i))
            .build()
            .map_err(|e| ZeForgeError::ThreadPool(e.to_string()))?;
        tracing::info!(
            "transformer ready on {} backend ({:?} kernels, {} threads): {}",
            backend.name(),
            backend.flavor(),
            pool.current_num_threads(),
            params
        );
        Ok(Self {
            params,
            weights,
            state,
            backend,
            pool,
        })
    }

    pub fn from_checkpoint(
        backend: B,
        checkpoint: &Checkpoint,
        num_threads: Option<usize>,
    ) -> ForgeResult<Self> {
        let weights = checkpoint.load_weights(&backend)?;
        Self::new(backend, *checkpoint.params(), weights, num_threads)
    }

    pub fn from_raw(
        backend: B,
        params: ModelParameters,
        raw: &RawWeights,
        num_threads: Option<usize>,
    ) -> ForgeResult<Self> {
        let weights = WeightSet::from_raw(&backend, &params, raw)?;
        Self::new(backend, params, weights, num_threads)
    }

    /// Logits for the token after `token`, which sits at `position`.
    ///
    /// `position` may repeat or move back to any already-decoded position
    /// (the cache is rewound), but may not skip ahead of the next unwritten
    /// one. All checks run before any buffer is touched.
    pub fn forward(&mut self, token: usize, position: usize) -> ForgeResult<&[f32]> {
        self.check_step(token, position)?;
        self.state.cache.rewind(position);

        let Self {
            params,
            weights,
            state,
            backend,
            pool,
        } = self;
        pool.install(|| decode_step(params, weights, state, backend, token, position))?;
        state.cache.commit(position);
        tracing::trace!("decoded token {} at position {}", token, position);
        Ok(state.logits.as_slice())
    }

    fn check_step(&self, token: usize, position: usize) -> ForgeResult<()> {
        if position >= self.params.seq_len {
            return Err(ZeForgeError::PositionOutOfRange {
                position,
                seq_len: self.params.seq_len,
            });
        }
        if token >= self.params.vocab_size {
            return Err(ZeForgeError::TokenOutOfRange {
                token,
                vocab_size: self.params.vocab_size,
            });
        }
        let committed = self.state.cache.committed();
        if position > committed {
            return Err(ZeForgeError::CacheGap {
                position,
                committed,
            });
        }
        Ok(())
    }

    /// Start a new sequence; the next call must be at position 0.
    pub fn reset(&mut self) {
        self.state.cache.clear();
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    pub fn weights(&self) -> &WeightSet<B> {
        &self.weights
    }

    pub fn state(&self) -> &DecodeState<B> {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Positions decoded so far in this sequence
    pub fn committed(&self) -> usize {
        self.state.cache.committed()
    }

    pub fn logits(&self) -> &[f32] {
        self.state.logits.as_slice()
    }
}

fn decode_step<B: ComputeBackend>(
    p: &ModelParameters,
    w: &WeightSet<B>,
    s: &mut DecodeState<B>,
    backend: &B,
    token: usize,
    position: usize,
) -> ForgeResult<()> {
    let flavor = backend.flavor();
    let layout = HeadLayout {
        head_size: p.head_size(),
        kv_dim: p.kv_dim(),
        kv_mul: p.kv_mul(),
        seq_len: p.seq_len,
    };

    s.x.as_mut_slice().copy_from_slice(w.embedding(token));

    for l in 0..p.n_layers {
        // attention
        flavor.rms_norm(s.xb.as_mut_slice(), s.x.as_slice(), w.rms_att.layer(l));
        flavor.matvec(s.q.as_mut_slice(), s.xb.as_slice(), w.wq.layer(l));
        flavor.matvec(s.k.as_mut_slice(), s.xb.as_slice(), w.wk.layer(l));
        flavor.matvec(s.v.as_mut_slice(), s.xb.as_slice(), w.wv.layer(l));
        ops::rope_rotate(s.q.as_mut_slice(), s.k.as_mut_slice(), position, layout.head_size);

        s.cache.write(l, position, s.k.as_slice(), s.v.as_slice());
        ops::multi_head_attention(
            s.xb.as_mut_slice(),
            &mut s.att,
            s.q.as_slice(),
            s.cache.layer_keys(l),
            s.cache.layer_values(l),
            position,
            layout,
        );
        flavor.matvec(s.xb2.as_mut_slice(), s.xb.as_slice(), w.wo.layer(l));
        ops::residual_add(s.x.as_mut_slice(), s.xb2.as_slice());

        // feed-forward
        flavor.rms_norm(s.xb.as_mut_slice(), s.x.as_slice(), w.rms_ffn.layer(l));
        flavor.matvec(s.hb.as_mut_slice(), s.xb.as_slice(), w.w1.layer(l));
        flavor.matvec(s.hb2.as_mut_slice(), s.xb.as_slice(), w.w3.layer(l));
        ops::silu_gate(s.hb.as_mut_slice(), s.hb2.as_slice());
        flavor.matvec(s.xb.as_mut_slice(), s.hb.as_slice(), w.w2.layer(l));
        ops::residual_add(s.x.as_mut_slice(), s.xb.as_slice());
    }

    flavor.rms_norm_in_place(s.x.as_mut_slice(), w.rms_final.as_slice());
    backend.classify(&mut s.logits, &s.x, w.classifier())
}

/// A transformer on whichever backend the configuration selected
pub enum Model {
    Cpu(Transformer<CpuBackend>),
    LevelZero(Transformer<ZeBackend>),
}

impl Model {
    pub fn load(path: impl AsRef<Path>, config: &BackendConfig) -> ForgeResult<Self> {
        let checkpoint = Checkpoint::open(path)?;
        Self::from_checkpoint(&checkpoint, config)
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint, config: &BackendConfig) -> ForgeResult<Self> {
        Ok(match config.backend {
            BackendKind::Cpu => Model::Cpu(Transformer::from_checkpoint(
                CpuBackend::new(config),
                checkpoint,
                config.num_threads,
            )?),
            BackendKind::LevelZero => Model::LevelZero(Transformer::from_checkpoint(
                ZeBackend::new(config)?,
                checkpoint,
                config.num_threads,
            )?),
        })
    }

    pub fn from_raw(
        params: ModelParameters,
        raw: &RawWeights,
        config: &BackendConfig,
    ) -> ForgeResult<Self> {
        Ok(match config.backend {
            BackendKind::Cpu => Model::Cpu(Transformer::from_raw(
                CpuBackend::new(config),
                params,
                raw,
                config.num_threads,
            )?),
            BackendKind::LevelZero => Model::LevelZero(Transformer::from_raw(
                ZeBackend::new(config)?,
                params,
                raw,
                config.num_threads,
            )?),
        })
    }

    pub fn forward(&mut self, token: usize, position: usize) -> ForgeResult<&[f32]> {
        match self {
            Model::Cpu(t) => t.forward(token, position),
            Model::LevelZero(t) => t.forward(token, position),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Model::Cpu(t) => t.reset(),
            Model::LevelZero(t) => t.reset(),
        }
    }

    pub fn params(&self) -> &ModelParameters {
        match self {
            Model::Cpu(t) => t.params(),
            Model::LevelZero(t) => t.params(),
        }
    }

    pub fn committed(&self) -> usize {
        match self {
            Model::Cpu(t) => t.committed(),
            Model::LevelZero(t) => t.committed(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Model::Cpu(t) => t.backend().name(),
            Model::LevelZero(t) => t.backend().name(),
        }
    }

    /// Device time of the last classifier launch (Level Zero with profiling)
    pub fn last_kernel_time(&self) -> Option<Duration> {
        match self {
            Model::Cpu(_) => None,
            Model::LevelZero(t) => t.backend().runtime().last_kernel_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KernelFlavor;

    fn tiny() -> Transformer<CpuBackend> {
        let params = ModelParameters::new(4, 8, 2, 2, 1, 6, 3, true).unwrap();
        let raw = RawWeights::from_fn(&params, |name, i| match name {
            "rms_att" | "rms_ffn" | "rms_final" => 1.0,
            _ => ((i * 7 + name.len()) % 11) as f32 * 0.05 - 0.25,
        });
        Transformer::from_raw(
            CpuBackend::with_flavor(KernelFlavor::Scalar),
            params,
            &raw,
            Some(2),
        )
        .unwrap()
    }

    #[test]
    fn test_forward_returns_vocab_logits() {
        let mut model = tiny();
        let logits = model.forward(3, 0).unwrap().to_vec();
        assert_eq!(logits.len(), 6);
        assert!(logits.iter().all(|v| v.is_finite()));
        assert_eq!(model.committed(), 1);
    }

    #[test]
    fn test_same_step_is_deterministic() {
        let mut a = tiny();
        let mut b = tiny();
        let la = a.forward(1, 0).unwrap().to_vec();
        let lb = b.forward(1, 0).unwrap().to_vec();
        assert_eq!(la, lb);
    }

    #[test]
    fn test_rewind_replays_identically() {
        let mut model = tiny();
        model.forward(1, 0).unwrap();
        let first = model.forward(2, 1).unwrap().to_vec();
        model.forward(5, 2).unwrap();

        let again = model.forward(2, 1).unwrap().to_vec();
        assert_eq!(first, again);
        assert_eq!(model.committed(), 2);
    }

    #[test]
    fn test_precondition_order() {
        let mut model = tiny();
        assert!(matches!(
            model.forward(99, 7),
            Err(ZeForgeError::PositionOutOfRange { position: 7, seq_len: 3 })
        ));
        assert!(matches!(
            model.forward(99, 0),
            Err(ZeForgeError::TokenOutOfRange { token: 99, vocab_size: 6 })
        ));
        assert!(matches!(
            model.forward(0, 1),
            Err(ZeForgeError::CacheGap { position: 1, committed: 0 })
        ));
    }

    #[test]
    fn test_reset_starts_over() {
        let mut model = tiny();
        let first = model.forward(4, 0).unwrap().to_vec();
        model.forward(0, 1).unwrap();
        model.reset();
        assert_eq!(model.committed(), 0);
        assert!(model.forward(0, 1).is_err());
        assert_eq!(model.forward(4, 0).unwrap(), first.as_slice());
    }

    #[test]
    fn test_model_enum_cpu() {
        let params = ModelParameters::new(4, 8, 1, 2, 2, 4, 4, true).unwrap();
        let raw = RawWeights::from_fn(&params, |_, _| 0.1);
        let mut model = Model::from_raw(params, &raw, &BackendConfig::cpu()).unwrap();
        assert_eq!(model.backend_name(), "cpu");
        assert_eq!(model.forward(0, 0).unwrap().len(), 4);
        assert!(model.last_kernel_time().is_none());
    }
}
