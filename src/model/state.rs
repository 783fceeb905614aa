//! Per-session activations and KV cache

use crate::backend::ComputeBackend;
use crate::error::ForgeResult;
use crate::model::config::ModelParameters;
use crate::model::kv_cache::KvCache;

/// Scratch buffers for one decode session.
///
/// `x` and `logits` come from the backend allocator because they are handed
/// to [`ComputeBackend::classify`]; the other activations do too so the whole
/// state lives in one kind of memory.
pub struct DecodeState<B: ComputeBackend> {
    /// Residual stream (`dim`)
    pub x: B::Buffer,
    pub xb: B::Buffer,
    pub xb2: B::Buffer,
    /// FFN scratch (`hidden_dim`)
    pub hb: B::Buffer,
    pub hb2: B::Buffer,
    pub q: B::Buffer,
    /// `kv_dim`
    pub k: B::Buffer,
    pub v: B::Buffer,
    /// Attention scores, one `seq_len` row per head
    pub att: Vec<f32>,
    pub logits: B::Buffer,
    pub cache: KvCache,
}

impl<B: ComputeBackend> DecodeState<B> {
    pub fn new(backend: &B, params: &ModelParameters) -> ForgeResult<Self> {
        let kv_dim = params.kv_dim();
        Ok(Self {
            x: backend.allocate(params.dim)?,
            xb: backend.allocate(params.dim)?,
            xb2: backend.allocate(params.dim)?,
            hb: backend.allocate(params.hidden_dim)?,
            hb2: backend.allocate(params.hidden_dim)?,
            q: backend.allocate(params.dim)?,
            k: backend.allocate(kv_dim)?,
            v: backend.allocate(kv_dim)?,
            att: vec![0.0; params.n_heads * params.seq_len],
            logits: backend.allocate(params.vocab_size)?,
            cache: KvCache::new(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, FloatBuffer};

    #[test]
    fn test_buffer_sizes() {
        let params = ModelParameters::new(8, 20, 3, 4, 2, 11, 5, true).unwrap();
        let state = DecodeState::new(&CpuBackend::default(), &params).unwrap();
        assert_eq!(state.x.len(), 8);
        assert_eq!(state.hb2.len(), 20);
        assert_eq!(state.k.len(), 4);
        assert_eq!(state.att.len(), 4 * 5);
        assert_eq!(state.logits.len(), 11);
        assert_eq!(state.cache.layer_keys(2).len(), 5 * 4);
    }
}
