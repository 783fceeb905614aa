//! Key/value cache for one decode session
//!
//! Host-resident: attention always runs on the CPU kernels, so the cache
//! never needs to be device-visible. Layout is `[layer][position * kv_dim]`
//! for keys and values separately.

use crate::model::config::ModelParameters;

#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    n_layers: usize,
    seq_len: usize,
    kv_dim: usize,
    /// Positions `0..committed` hold finished entries in every layer
    committed: usize,
}

impl KvCache {
    pub fn new(params: &ModelParameters) -> Self {
        let len = params.n_layers * params.kv_layer_len();
        tracing::debug!(
            "KvCache::new: {} layers x {} positions x {} kv_dim ({} floats each for keys and values)",
            params.n_layers,
            params.seq_len,
            params.kv_dim(),
            len
        );
        Self {
            keys: vec![0.0; len],
            values: vec![0.0; len],
            n_layers: params.n_layers,
            seq_len: params.seq_len,
            kv_dim: params.kv_dim(),
            committed: 0,
        }
    }

    fn layer_range(&self, layer: usize) -> std::ops::Range<usize> {
        debug_assert!(layer < self.n_layers);
        let len = self.seq_len * self.kv_dim;
        layer * len..(layer + 1) * len
    }

    fn slot(&self, layer: usize, position: usize) -> std::ops::Range<usize> {
        debug_assert!(position < self.seq_len);
        let start = self.layer_range(layer).start + position * self.kv_dim;
        start..start + self.kv_dim
    }

    /// Store this step's key and value vectors for `layer` at `position`.
    pub fn write(&mut self, layer: usize, position: usize, k: &[f32], v: &[f32]) {
        let slot = self.slot(layer, position);
        self.keys[slot.clone()].copy_from_slice(k);
        self.values[slot].copy_from_slice(v);
    }

    /// All of `layer`'s keys, `seq_len * kv_dim` floats
    pub fn layer_keys(&self, layer: usize) -> &[f32] {
        &self.keys[self.layer_range(layer)]
    }

    pub fn layer_values(&self, layer: usize) -> &[f32] {
        &self.values[self.layer_range(layer)]
    }

    /// Key vector stored for `layer` at `position`
    pub fn key(&self, layer: usize, position: usize) -> &[f32] {
        &self.keys[self.slot(layer, position)]
    }

    pub fn value(&self, layer: usize, position: usize) -> &[f32] {
        &self.values[self.slot(layer, position)]
    }

    /// Number of positions written by completed decode steps
    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn capacity(&self) -> usize {
        self.seq_len
    }

    /// Mark `position` complete in every layer.
    pub fn commit(&mut self, position: usize) {
        debug_assert!(position <= self.committed);
        self.committed = position + 1;
    }

    /// Forget positions `position..`. Their storage is overwritten by the
    /// steps that follow.
    pub fn rewind(&mut self, position: usize) {
        if position < self.committed {
            tracing::debug!("KvCache::rewind: {} -> {}", self.committed, position);
            self.committed = position;
        }
    }

    pub fn clear(&mut self) {
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ModelParameters {
        ModelParameters::new(8, 16, 2, 4, 2, 10, 3, true).unwrap()
    }

    #[test]
    fn test_layout_sizes() {
        let cache = KvCache::new(&params());
        assert_eq!(cache.layer_keys(0).len(), 3 * 4);
        assert_eq!(cache.layer_values(1).len(), 3 * 4);
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.committed(), 0);
    }

    #[test]
    fn test_write_lands_in_layer_and_position() {
        let mut cache = KvCache::new(&params());
        cache.write(1, 2, &[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(cache.key(1, 2), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.value(1, 2), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(&cache.layer_keys(1)[8..12], &[1.0, 2.0, 3.0, 4.0]);
        assert!(cache.layer_keys(0).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_commit_rewind_clear() {
        let mut cache = KvCache::new(&params());
        cache.commit(0);
        cache.commit(1);
        assert_eq!(cache.committed(), 2);
        cache.rewind(1);
        assert_eq!(cache.committed(), 1);
        cache.rewind(5);
        assert_eq!(cache.committed(), 1);
        cache.clear();
        assert_eq!(cache.committed(), 0);
    }
}
