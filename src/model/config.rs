//! Model hyperparameters read from the checkpoint header

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::error::{config_error, ForgeResult, ZeForgeError};

/// Number of i32 fields in the checkpoint header
pub const HEADER_FIELDS: usize = 7;

/// Header size in bytes
pub const HEADER_BYTES: usize = HEADER_FIELDS * std::mem::size_of::<i32>();

/// Immutable transformer hyperparameters plus derived sizes.
///
/// Construct through [`ModelParameters::new`] or
/// [`ModelParameters::from_header`]; both validate every invariant the decode
/// pipeline relies on, so downstream code never re-checks dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelParameters {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    /// Classifier aliases the embedding table
    pub shared_weights: bool,
}

impl ModelParameters {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        hidden_dim: usize,
        n_layers: usize,
        n_heads: usize,
        n_kv_heads: usize,
        vocab_size: usize,
        seq_len: usize,
        shared_weights: bool,
    ) -> ForgeResult<Self> {
        let params = Self {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            seq_len,
            shared_weights,
        };
        params.validate()?;
        Ok(params)
    }

    /// Parse the 7-field little-endian header.
    ///
    /// A negative `vocab_size` marks an untied classifier; its absolute value
    /// is the vocabulary size.
    pub fn from_header(bytes: &[u8]) -> ForgeResult<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(ZeForgeError::InvalidHeader(format!(
                "need {} bytes, got {}",
                HEADER_BYTES,
                bytes.len()
            )));
        }

        let mut fields = [0i32; HEADER_FIELDS];
        LittleEndian::read_i32_into(&bytes[..HEADER_BYTES], &mut fields);
        let [dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len] = fields;

        let shared_weights = vocab_size > 0;
        Self::new(
            positive("dim", dim)?,
            positive("hidden_dim", hidden_dim)?,
            positive("n_layers", n_layers)?,
            positive("n_heads", n_heads)?,
            positive("n_kv_heads", n_kv_heads)?,
            positive("vocab_size", vocab_size.checked_abs().unwrap_or(0))?,
            positive("seq_len", seq_len)?,
            shared_weights,
        )
    }

    /// Encode back into header form (negated vocab when untied)
    pub fn to_header(&self) -> ForgeResult<[u8; HEADER_BYTES]> {
        let vocab = to_i32("vocab_size", self.vocab_size)?;
        let fields = [
            to_i32("dim", self.dim)?,
            to_i32("hidden_dim", self.hidden_dim)?,
            to_i32("n_layers", self.n_layers)?,
            to_i32("n_heads", self.n_heads)?,
            to_i32("n_kv_heads", self.n_kv_heads)?,
            if self.shared_weights { vocab } else { -vocab },
            to_i32("seq_len", self.seq_len)?,
        ];
        let mut out = [0u8; HEADER_BYTES];
        LittleEndian::write_i32_into(&fields, &mut out);
        Ok(out)
    }

    fn validate(&self) -> ForgeResult<()> {
        let named = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];
        for (field, value) in named {
            if value == 0 {
                return Err(config_error(field, "must be positive, got 0"));
            }
        }
        if self.dim % self.n_heads != 0 {
            return Err(config_error(
                "n_heads",
                format!("{} does not divide dim {}", self.n_heads, self.dim),
            ));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(config_error(
                "n_kv_heads",
                format!("{} does not divide n_heads {}", self.n_kv_heads, self.n_heads),
            ));
        }
        // rotary encoding rotates (even, odd) pairs inside each head
        if self.head_size() % 2 != 0 {
            return Err(config_error(
                "n_heads",
                format!("head_size {} must be even", self.head_size()),
            ));
        }
        self.check_sizes()
    }

    /// Every tensor, the KV cache and the checkpoint byte count must fit in
    /// `usize`; layout code downstream multiplies without checking.
    fn check_sizes(&self) -> ForgeResult<()> {
        let kv_dim = element_count("n_kv_heads", &[self.dim, self.n_kv_heads])? / self.n_heads;
        let embedding = element_count("vocab_size", &[self.vocab_size, self.dim])?;
        let norms = element_count("n_layers", &[self.n_layers, self.dim])?;
        let square = element_count("dim", &[self.n_layers, self.dim, self.dim])?;
        let kv = element_count("n_kv_heads", &[self.n_layers, kv_dim, self.dim])?;
        let ffn = element_count("hidden_dim", &[self.n_layers, self.hidden_dim, self.dim])?;
        let reserved = element_count("seq_len", &[self.seq_len, self.head_size()])?;
        element_count("seq_len", &[self.n_layers, self.seq_len, kv_dim])?;
        element_count("seq_len", &[self.n_heads, self.seq_len])?;

        let classifier = if self.shared_weights { 0 } else { embedding };
        [
            embedding, norms, square, kv, kv, square, norms, ffn, ffn, ffn, self.dim, reserved,
            classifier,
        ]
        .iter()
        .try_fold(0usize, |total, &n| total.checked_add(n))
        .and_then(|floats| floats.checked_mul(std::mem::size_of::<f32>()))
        .and_then(|bytes| bytes.checked_add(HEADER_BYTES))
        .map(|_| ())
        .ok_or_else(|| config_error("n_layers", "checkpoint size overflows usize"))
    }

    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Query heads sharing one key/value head
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Floats in each of the two reserved blocks before the classifier
    pub fn reserved_block_len(&self) -> usize {
        self.seq_len * self.head_size() / 2
    }

    /// Floats held by one layer's slice of the KV cache (keys or values)
    pub fn kv_layer_len(&self) -> usize {
        self.seq_len * self.kv_dim()
    }
}

impl fmt::Display for ModelParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dim={} hidden_dim={} n_layers={} n_heads={} n_kv_heads={} vocab_size={} seq_len={} shared_weights={}",
            self.dim,
            self.hidden_dim,
            self.n_layers,
            self.n_heads,
            self.n_kv_heads,
            self.vocab_size,
            self.seq_len,
            self.shared_weights
        )
    }
}

fn positive(field: &'static str, value: i32) -> ForgeResult<usize> {
    if value <= 0 {
        return Err(config_error(field, format!("must be positive, got {}", value)));
    }
    Ok(value as usize)
}

fn element_count(field: &'static str, factors: &[usize]) -> ForgeResult<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| config_error(field, format!("size {:?} overflows usize", factors)))
}

fn to_i32(field: &'static str, value: usize) -> ForgeResult<i32> {
    i32::try_from(value).map_err(|_| config_error(field, format!("{} does not fit in i32", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(fields: [i32; 7]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_BYTES];
        LittleEndian::write_i32_into(&fields, &mut out);
        out
    }

    #[test]
    fn test_from_header_shared() {
        let params = ModelParameters::from_header(&header([64, 172, 2, 8, 4, 32, 16])).unwrap();
        assert_eq!(params.dim, 64);
        assert_eq!(params.vocab_size, 32);
        assert!(params.shared_weights);
        assert_eq!(params.head_size(), 8);
        assert_eq!(params.kv_dim(), 32);
        assert_eq!(params.kv_mul(), 2);
        assert_eq!(params.reserved_block_len(), 16 * 8 / 2);
    }

    #[test]
    fn test_negative_vocab_means_unshared() {
        let params = ModelParameters::from_header(&header([4, 8, 1, 2, 2, -4, 4])).unwrap();
        assert_eq!(params.vocab_size, 4);
        assert!(!params.shared_weights);
    }

    #[test]
    fn test_header_roundtrip_keeps_sign() {
        let params = ModelParameters::new(4, 8, 1, 2, 2, 4, 4, false).unwrap();
        let bytes = params.to_header().unwrap();
        assert_eq!(LittleEndian::read_i32(&bytes[20..24]), -4);
        assert_eq!(ModelParameters::from_header(&bytes).unwrap(), params);
    }

    #[test]
    fn test_rejects_indivisible_kv_heads() {
        let err = ModelParameters::from_header(&header([48, 96, 1, 6, 4, 10, 8])).unwrap_err();
        assert!(matches!(
            err,
            ZeForgeError::InvalidModelConfig {
                field: "n_kv_heads",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_non_positive_field() {
        let err = ModelParameters::from_header(&header([4, 8, 0, 2, 2, 4, 4])).unwrap_err();
        assert!(err.to_string().contains("n_layers"));

        let err = ModelParameters::from_header(&header([4, 8, 1, 2, 2, 4, -1])).unwrap_err();
        assert!(err.to_string().contains("seq_len"));
    }

    #[test]
    fn test_rejects_min_vocab() {
        let err = ModelParameters::from_header(&header([4, 8, 1, 2, 2, i32::MIN, 4])).unwrap_err();
        assert!(err.to_string().contains("vocab_size"));
    }

    #[test]
    fn test_rejects_odd_head_size() {
        let err = ModelParameters::new(6, 8, 1, 2, 2, 4, 4, true).unwrap_err();
        assert!(err.to_string().contains("head_size 3"));
    }

    #[test]
    fn test_rejects_header_whose_tensor_sizes_overflow() {
        let err = ModelParameters::from_header(&header([1 << 30, 1 << 30, 1 << 30, 2, 2, 4, 4]))
            .unwrap_err();
        assert!(matches!(
            err,
            ZeForgeError::InvalidModelConfig { field: "dim", .. }
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_large_header_within_usize_is_accepted() {
        let params = ModelParameters::from_header(&header([8192, 28672, 80, 64, 8, 128_256, 8192]))
            .unwrap();
        assert_eq!(params.kv_dim(), 1024);
    }

    #[test]
    fn test_short_header() {
        let err = ModelParameters::from_header(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, ZeForgeError::InvalidHeader(_)));
    }
}
