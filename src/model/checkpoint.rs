//! Memory-mapped checkpoint files
//!
//! Layout: 7 little-endian i32 header fields, then every tensor listed by
//! [`checkpoint_layout`] as little-endian f32.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use memmap2::Mmap;

use crate::backend::ComputeBackend;
use crate::error::ForgeResult;
use crate::model::config::{ModelParameters, HEADER_BYTES};
use crate::model::weights::{checkpoint_layout, weight_bytes_len, RawWeights, WeightSet};

/// An opened checkpoint: parsed header over a read-only mapping
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    params: ModelParameters,
    mmap: Mmap,
}

impl Checkpoint {
    pub fn open(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the file is not modified while
        // the checkpoint is open.
        let mmap = unsafe { Mmap::map(&file)? };
        let params = ModelParameters::from_header(&mmap)?;

        let expected = HEADER_BYTES + weight_bytes_len(&params);
        tracing::info!(
            "opened checkpoint {} ({} bytes, {} expected): {}",
            path.display(),
            mmap.len(),
            expected,
            params
        );
        Ok(Self {
            path: path.to_path_buf(),
            params,
            mmap,
        })
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything after the header
    pub fn weight_bytes(&self) -> &[u8] {
        &self.mmap[HEADER_BYTES..]
    }

    /// Copy every tensor into buffers from `backend`.
    pub fn load_weights<B: ComputeBackend>(&self, backend: &B) -> ForgeResult<WeightSet<B>> {
        let weights = WeightSet::from_bytes(backend, &self.params, self.weight_bytes())?;
        tracing::debug!(
            "loaded weights into {} buffers (shared classifier: {})",
            backend.name(),
            weights.is_shared()
        );
        Ok(weights)
    }
}

/// Serialize `params` and `raw` in checkpoint layout.
///
/// An untied classifier is signalled by a negative vocabulary size; the
/// reserved blocks are written as zeros.
pub fn write_checkpoint<W: Write>(
    params: &ModelParameters,
    raw: &RawWeights,
    writer: W,
) -> ForgeResult<()> {
    raw.check(params)?;
    let mut out = BufWriter::new(writer);
    out.write_all(&params.to_header()?)?;
    for spec in checkpoint_layout(params) {
        match raw.tensor(spec.name) {
            Some(tensor) => {
                for &v in tensor {
                    out.write_f32::<LittleEndian>(v)?;
                }
            }
            None => {
                for _ in 0..spec.len {
                    out.write_f32::<LittleEndian>(0.0)?;
                }
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// [`write_checkpoint`] to a new file at `path`
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    params: &ModelParameters,
    raw: &RawWeights,
) -> ForgeResult<()> {
    let path = path.as_ref();
    write_checkpoint(params, raw, File::create(path)?)?;
    tracing::debug!("wrote checkpoint {}", path.display());
    Ok(())
}
