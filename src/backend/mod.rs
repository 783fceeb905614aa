//! Compute backends
//!
//! A backend owns buffer allocation and the classifier projection. The CPU
//! backend keeps everything in host memory; the Level Zero backend allocates
//! unified shared memory and offloads the classifier matvec to the device.

pub mod buffer;
pub mod config;
pub mod cpu;
pub mod ze_backend;

pub use buffer::{FloatBuffer, HostBuffer};
pub use config::{BackendConfig, BackendKind, ModuleFormat};
pub use cpu::{CpuBackend, KernelFlavor};
pub use ze_backend::{ZeBackend, ZeError, ZeRuntime};

use crate::error::ForgeResult;

/// Strategy chosen once at model load.
///
/// Everything except the final projection runs through the CPU kernels on
/// `Self::Buffer` slices; [`ComputeBackend::classify`] is the only stage a
/// backend may move off the host.
pub trait ComputeBackend: Send + Sync {
    type Buffer: FloatBuffer;

    fn name(&self) -> &'static str;

    /// Kernel flavor for the host-side stages
    fn flavor(&self) -> KernelFlavor;

    /// Zero-initialized buffer of `len` floats
    fn allocate(&self, len: usize) -> ForgeResult<Self::Buffer>;

    fn allocate_from(&self, data: &[f32]) -> ForgeResult<Self::Buffer> {
        let mut buf = self.allocate(data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(buf)
    }

    /// `logits = classifier (vocab_size x dim) . x`
    fn classify(
        &self,
        logits: &mut Self::Buffer,
        x: &Self::Buffer,
        classifier: &Self::Buffer,
    ) -> ForgeResult<()>;
}
