//! Model weights in checkpoint order
//!
//! Tensors are stored tensor-major: every layer's attention-norm vector, then
//! every layer's `wq`, and so on. Each stacked tensor lives in one backend
//! buffer and is addressed per layer through [`Stacked::layer`].

use byteorder::{ByteOrder, LittleEndian};

use crate::backend::{ComputeBackend, FloatBuffer};
use crate::error::{config_error, ForgeResult, ZeForgeError};
use crate::model::config::ModelParameters;

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Name used for the two skipped blocks before the classifier
pub const RESERVED_FIELD: &str = "reserved";

/// One contiguous run of floats in the checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: &'static str,
    /// Floats across all layers
    pub len: usize,
}

/// Every float run after the header, in file order.
pub fn checkpoint_layout(params: &ModelParameters) -> Vec<TensorSpec> {
    let ModelParameters {
        dim,
        hidden_dim,
        n_layers,
        vocab_size,
        ..
    } = *params;
    let kv_dim = params.kv_dim();
    let spec = |name, len| TensorSpec { name, len };

    let mut layout = vec![
        spec("token_embedding", vocab_size * dim),
        spec("rms_att", n_layers * dim),
        spec("wq", n_layers * dim * dim),
        spec("wk", n_layers * kv_dim * dim),
        spec("wv", n_layers * kv_dim * dim),
        spec("wo", n_layers * dim * dim),
        spec("rms_ffn", n_layers * dim),
        spec("w1", n_layers * hidden_dim * dim),
        spec("w2", n_layers * dim * hidden_dim),
        spec("w3", n_layers * hidden_dim * dim),
        spec("rms_final", dim),
        spec(RESERVED_FIELD, 2 * params.reserved_block_len()),
    ];
    if !params.shared_weights {
        layout.push(spec("classifier", vocab_size * dim));
    }
    layout
}

/// Bytes of weight data expected after the header
pub fn weight_bytes_len(params: &ModelParameters) -> usize {
    checkpoint_layout(params).iter().map(|t| t.len).sum::<usize>() * F32_BYTES
}

/// A per-layer tensor kept as one buffer of `n_layers * layer_len` floats
pub struct Stacked<Buf> {
    data: Buf,
    layer_len: usize,
}

impl<Buf: FloatBuffer> Stacked<Buf> {
    fn new(data: Buf, n_layers: usize) -> Self {
        let layer_len = data.len() / n_layers;
        Self { data, layer_len }
    }

    pub fn layer(&self, layer: usize) -> &[f32] {
        &self.data.as_slice()[layer * self.layer_len..(layer + 1) * self.layer_len]
    }

    pub fn layer_len(&self) -> usize {
        self.layer_len
    }

    pub fn buffer(&self) -> &Buf {
        &self.data
    }
}

/// Read-only weights resident in the backend's memory
pub struct WeightSet<B: ComputeBackend> {
    pub token_embedding: B::Buffer,
    pub rms_att: Stacked<B::Buffer>,
    pub wq: Stacked<B::Buffer>,
    pub wk: Stacked<B::Buffer>,
    pub wv: Stacked<B::Buffer>,
    pub wo: Stacked<B::Buffer>,
    pub rms_ffn: Stacked<B::Buffer>,
    pub w1: Stacked<B::Buffer>,
    pub w2: Stacked<B::Buffer>,
    pub w3: Stacked<B::Buffer>,
    pub rms_final: B::Buffer,
    /// `None` when the classifier is tied to the embedding table
    classifier: Option<B::Buffer>,
    dim: usize,
}

impl<B: ComputeBackend> WeightSet<B> {
    /// Slice the weight section of a checkpoint (everything after the
    /// header) into backend buffers.
    pub fn from_bytes(backend: &B, params: &ModelParameters, bytes: &[u8]) -> ForgeResult<Self> {
        let mut cursor = TensorCursor::new(bytes, params);
        let layers = params.n_layers;

        let token_embedding = cursor.load(backend)?;
        let rms_att = Stacked::new(cursor.load(backend)?, layers);
        let wq = Stacked::new(cursor.load(backend)?, layers);
        let wk = Stacked::new(cursor.load(backend)?, layers);
        let wv = Stacked::new(cursor.load(backend)?, layers);
        let wo = Stacked::new(cursor.load(backend)?, layers);
        let rms_ffn = Stacked::new(cursor.load(backend)?, layers);
        let w1 = Stacked::new(cursor.load(backend)?, layers);
        let w2 = Stacked::new(cursor.load(backend)?, layers);
        let w3 = Stacked::new(cursor.load(backend)?, layers);
        let rms_final = cursor.load(backend)?;
        cursor.skip()?;
        let classifier = if params.shared_weights {
            None
        } else {
            Some(cursor.load(backend)?)
        };
        if cursor.remaining() > 0 {
            tracing::debug!("{} trailing bytes after the last tensor", cursor.remaining());
        }

        Ok(Self {
            token_embedding,
            rms_att,
            wq,
            wk,
            wv,
            wo,
            rms_ffn,
            w1,
            w2,
            w3,
            rms_final,
            classifier,
            dim: params.dim,
        })
    }

    /// Copy host-side weights into backend buffers.
    pub fn from_raw(backend: &B, params: &ModelParameters, raw: &RawWeights) -> ForgeResult<Self> {
        raw.check(params)?;
        let layers = params.n_layers;
        let stacked = |v: &[f32]| -> ForgeResult<Stacked<B::Buffer>> {
            Ok(Stacked::new(backend.allocate_from(v)?, layers))
        };
        let classifier = match (&raw.classifier, params.shared_weights) {
            (Some(c), false) => Some(backend.allocate_from(c)?),
            _ => None,
        };
        Ok(Self {
            token_embedding: backend.allocate_from(&raw.token_embedding)?,
            rms_att: stacked(&raw.rms_att)?,
            wq: stacked(&raw.wq)?,
            wk: stacked(&raw.wk)?,
            wv: stacked(&raw.wv)?,
            wo: stacked(&raw.wo)?,
            rms_ffn: stacked(&raw.rms_ffn)?,
            w1: stacked(&raw.w1)?,
            w2: stacked(&raw.w2)?,
            w3: stacked(&raw.w3)?,
            rms_final: backend.allocate_from(&raw.rms_final)?,
            classifier,
            dim: params.dim,
        })
    }

    /// Embedding row for `token`; caller has range-checked it
    pub fn embedding(&self, token: usize) -> &[f32] {
        &self.token_embedding.as_slice()[token * self.dim..(token + 1) * self.dim]
    }

    /// Output projection, falling back to the tied embedding table
    pub fn classifier(&self) -> &B::Buffer {
        self.classifier.as_ref().unwrap_or(&self.token_embedding)
    }

    pub fn is_shared(&self) -> bool {
        self.classifier.is_none()
    }
}

/// Walks the weight bytes in [`checkpoint_layout`] order
struct TensorCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    layout: std::vec::IntoIter<TensorSpec>,
}

impl<'a> TensorCursor<'a> {
    fn new(bytes: &'a [u8], params: &ModelParameters) -> Self {
        Self {
            bytes,
            offset: 0,
            layout: checkpoint_layout(params).into_iter(),
        }
    }

    fn take(&mut self) -> ForgeResult<(TensorSpec, &'a [u8])> {
        let spec = self
            .layout
            .next()
            .ok_or_else(|| ZeForgeError::InvalidHeader("read past the last tensor".to_string()))?;
        let needed = self.offset + spec.len * F32_BYTES;
        if needed > self.bytes.len() {
            return Err(ZeForgeError::CheckpointTruncated {
                field: spec.name,
                needed,
                available: self.bytes.len(),
            });
        }
        let out = &self.bytes[self.offset..needed];
        self.offset = needed;
        Ok((spec, out))
    }

    fn load<B: ComputeBackend>(&mut self, backend: &B) -> ForgeResult<B::Buffer> {
        let (spec, src) = self.take()?;
        let mut buf = backend.allocate(spec.len)?;
        LittleEndian::read_f32_into(src, buf.as_mut_slice());
        tracing::trace!("loaded {} ({} floats)", spec.name, spec.len);
        Ok(buf)
    }

    fn skip(&mut self) -> ForgeResult<()> {
        self.take().map(|_| ())
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

/// Host copy of every tensor, laid out as in the checkpoint
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawWeights {
    pub token_embedding: Vec<f32>,
    pub rms_att: Vec<f32>,
    pub wq: Vec<f32>,
    pub wk: Vec<f32>,
    pub wv: Vec<f32>,
    pub wo: Vec<f32>,
    pub rms_ffn: Vec<f32>,
    pub w1: Vec<f32>,
    pub w2: Vec<f32>,
    pub w3: Vec<f32>,
    pub rms_final: Vec<f32>,
    pub classifier: Option<Vec<f32>>,
}

impl RawWeights {
    /// All-zero weights of the right shapes (classifier present when unshared)
    pub fn zeroed(params: &ModelParameters) -> Self {
        let mut raw = Self::default();
        for spec in checkpoint_layout(params) {
            let zeros = vec![0.0; spec.len];
            match raw.field_mut(spec.name) {
                Some(slot) => *slot = zeros,
                None if spec.name == "classifier" => raw.classifier = Some(zeros),
                None => {}
            }
        }
        raw
    }

    /// Fill every tensor from `f(field, index)`.
    pub fn from_fn(params: &ModelParameters, mut f: impl FnMut(&'static str, usize) -> f32) -> Self {
        let mut raw = Self::zeroed(params);
        for spec in checkpoint_layout(params) {
            if let Some(slot) = raw.tensor_mut(spec.name) {
                for (i, v) in slot.iter_mut().enumerate() {
                    *v = f(spec.name, i);
                }
            }
        }
        raw
    }

    /// Tensor by checkpoint field name; the reserved blocks have none.
    pub fn tensor(&self, name: &str) -> Option<&[f32]> {
        match name {
            "token_embedding" => Some(&self.token_embedding),
            "rms_att" => Some(&self.rms_att),
            "wq" => Some(&self.wq),
            "wk" => Some(&self.wk),
            "wv" => Some(&self.wv),
            "wo" => Some(&self.wo),
            "rms_ffn" => Some(&self.rms_ffn),
            "w1" => Some(&self.w1),
            "w2" => Some(&self.w2),
            "w3" => Some(&self.w3),
            "rms_final" => Some(&self.rms_final),
            "classifier" => self.classifier.as_deref(),
            _ => None,
        }
    }

    fn tensor_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        match name {
            "classifier" => self.classifier.as_mut(),
            other => self.field_mut(other),
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        match name {
            "token_embedding" => Some(&mut self.token_embedding),
            "rms_att" => Some(&mut self.rms_att),
            "wq" => Some(&mut self.wq),
            "wk" => Some(&mut self.wk),
            "wv" => Some(&mut self.wv),
            "wo" => Some(&mut self.wo),
            "rms_ffn" => Some(&mut self.rms_ffn),
            "w1" => Some(&mut self.w1),
            "w2" => Some(&mut self.w2),
            "w3" => Some(&mut self.w3),
            "rms_final" => Some(&mut self.rms_final),
            _ => None,
        }
    }

    /// Every tensor has the length `params` implies.
    pub fn check(&self, params: &ModelParameters) -> ForgeResult<()> {
        for spec in checkpoint_layout(params) {
            if spec.name == RESERVED_FIELD {
                continue;
            }
            let got = self.tensor(spec.name).map(<[f32]>::len);
            if got != Some(spec.len) {
                return Err(config_error(
                    spec.name,
                    format!("expected {} floats, got {:?}", spec.len, got),
                ));
            }
        }
        if params.shared_weights && self.classifier.is_some() {
            return Err(config_error(
                "classifier",
                "present but the model shares embedding weights",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn params(shared: bool) -> ModelParameters {
        ModelParameters::new(4, 8, 2, 2, 1, 5, 6, shared).unwrap()
    }

    fn encode(raw: &RawWeights, params: &ModelParameters) -> Vec<u8> {
        let mut floats = Vec::new();
        for spec in checkpoint_layout(params) {
            match raw.tensor(spec.name) {
                Some(t) => floats.extend_from_slice(t),
                None => floats.extend(std::iter::repeat(0.0).take(spec.len)),
            }
        }
        let mut bytes = vec![0u8; floats.len() * 4];
        LittleEndian::write_f32_into(&floats, &mut bytes);
        bytes
    }

    #[test]
    fn test_layout_order_and_sizes() {
        let p = params(false);
        let names: Vec<_> = checkpoint_layout(&p).iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "token_embedding",
                "rms_att",
                "wq",
                "wk",
                "wv",
                "wo",
                "rms_ffn",
                "w1",
                "w2",
                "w3",
                "rms_final",
                "reserved",
                "classifier"
            ]
        );
        let layout = checkpoint_layout(&p);
        // kv_dim = 2: wk is (kv_dim x dim) per layer
        assert_eq!(layout[3].len, 2 * 2 * 4);
        // two blocks of seq_len * head_size / 2
        assert_eq!(layout[11].len, 2 * (6 * 2 / 2));
        assert_eq!(checkpoint_layout(&params(true)).len(), 12);
    }

    #[test]
    fn test_from_bytes_slices_per_layer() {
        let p = params(true);
        let raw = RawWeights::from_fn(&p, |name, i| match name {
            "wq" => i as f32,
            "rms_final" => 7.0,
            _ => 0.5,
        });
        let w = WeightSet::from_bytes(&CpuBackend::default(), &p, &encode(&raw, &p)).unwrap();
        assert_eq!(w.wq.layer_len(), 16);
        assert_eq!(w.wq.layer(1)[0], 16.0);
        assert_eq!(w.rms_final.as_slice(), &[7.0; 4]);
        assert!(w.is_shared());
        assert_eq!(w.classifier().as_slice(), w.token_embedding.as_slice());
    }

    #[test]
    fn test_unshared_classifier_is_separate() {
        let p = params(false);
        let raw = RawWeights::from_fn(&p, |name, _| if name == "classifier" { 3.0 } else { 1.0 });
        let w = WeightSet::from_bytes(&CpuBackend::default(), &p, &encode(&raw, &p)).unwrap();
        assert!(!w.is_shared());
        assert!(w.classifier().as_slice().iter().all(|&v| v == 3.0));
        assert_eq!(w.embedding(4), &[1.0; 4]);
    }

    #[test]
    fn test_truncation_names_first_missing_field() {
        let p = params(false);
        let bytes = encode(&RawWeights::zeroed(&p), &p);
        let short = &bytes[..bytes.len() - 4];
        match WeightSet::from_bytes(&CpuBackend::default(), &p, short) {
            Err(ZeForgeError::CheckpointTruncated { field, needed, available }) => {
                assert_eq!(field, "classifier");
                assert_eq!(needed, bytes.len());
                assert_eq!(available, bytes.len() - 4);
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("truncated checkpoint accepted"),
        }

        let err = WeightSet::from_bytes(&CpuBackend::default(), &p, &bytes[..100])
            .err()
            .unwrap();
        assert!(err.to_string().contains("rms_att"));
    }

    #[test]
    fn test_weight_bytes_len_matches_encoding() {
        let p = params(false);
        assert_eq!(weight_bytes_len(&p), encode(&RawWeights::zeroed(&p), &p).len());
    }

    #[test]
    fn test_raw_check_rejects_wrong_shape() {
        let p = params(true);
        let mut raw = RawWeights::zeroed(&p);
        raw.w2.pop();
        let err = raw.check(&p).unwrap_err();
        assert!(err.to_string().contains("w2"));

        let mut raw = RawWeights::zeroed(&p);
        raw.classifier = Some(vec![0.0; 20]);
        assert!(raw.check(&p).is_err());
    }
}
