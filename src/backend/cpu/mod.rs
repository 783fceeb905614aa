//! CPU backend: numeric kernels on the rayon pool, weights in host memory

pub mod cpu_features;
pub mod ops;
#[cfg(feature = "simd")]
pub mod simd;

pub use cpu_features::{CpuArch, CpuFeatures};
pub use ops::HeadLayout;

use crate::backend::buffer::HostBuffer;
use crate::backend::config::BackendConfig;
use crate::backend::{ComputeBackend, FloatBuffer};
use crate::error::ForgeResult;

/// Which implementation of the projection and norm kernels to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFlavor {
    /// Four-way partial sums
    Scalar,
    /// std::simd accumulators (only reachable with the `simd` feature)
    Vector,
}

impl KernelFlavor {
    /// Turn the configured preference into what this build and CPU can run.
    pub fn resolve(requested: bool) -> Self {
        if !requested {
            return KernelFlavor::Scalar;
        }
        if !cfg!(feature = "simd") {
            tracing::warn!("vector kernels requested but built without the `simd` feature; using scalar kernels");
            return KernelFlavor::Scalar;
        }
        let features = CpuFeatures::get();
        if !features.supports_vector_kernels() {
            tracing::warn!("{} lacks native vector width; using scalar kernels", features);
            return KernelFlavor::Scalar;
        }
        KernelFlavor::Vector
    }

    pub fn matvec(self, out: &mut [f32], x: &[f32], w: &[f32]) {
        match self {
            KernelFlavor::Scalar => ops::matvec(out, x, w),
            #[cfg(feature = "simd")]
            KernelFlavor::Vector => simd::matvec_simd(out, x, w),
            #[cfg(not(feature = "simd"))]
            KernelFlavor::Vector => ops::matvec(out, x, w),
        }
    }

    pub fn rms_norm(self, out: &mut [f32], input: &[f32], weight: &[f32]) {
        match self {
            KernelFlavor::Scalar => ops::rms_norm(out, input, weight),
            #[cfg(feature = "simd")]
            KernelFlavor::Vector => simd::rms_norm_simd(out, input, weight),
            #[cfg(not(feature = "simd"))]
            KernelFlavor::Vector => ops::rms_norm(out, input, weight),
        }
    }

    pub fn rms_norm_in_place(self, x: &mut [f32], weight: &[f32]) {
        match self {
            KernelFlavor::Scalar => ops::rms_norm_in_place(x, weight),
            #[cfg(feature = "simd")]
            KernelFlavor::Vector => simd::rms_norm_in_place_simd(x, weight),
            #[cfg(not(feature = "simd"))]
            KernelFlavor::Vector => ops::rms_norm_in_place(x, weight),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuBackend {
    flavor: KernelFlavor,
}

impl CpuBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self::with_flavor(KernelFlavor::resolve(config.vector_kernels))
    }

    pub fn with_flavor(flavor: KernelFlavor) -> Self {
        tracing::debug!("CPU backend using {:?} kernels", flavor);
        Self { flavor }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::with_flavor(KernelFlavor::Scalar)
    }
}

impl ComputeBackend for CpuBackend {
    type Buffer = HostBuffer;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn flavor(&self) -> KernelFlavor {
        self.flavor
    }

    fn allocate(&self, len: usize) -> ForgeResult<HostBuffer> {
        Ok(HostBuffer::zeroed(len))
    }

    fn classify(
        &self,
        logits: &mut HostBuffer,
        x: &HostBuffer,
        classifier: &HostBuffer,
    ) -> ForgeResult<()> {
        self.flavor
            .matvec(logits.as_mut_slice(), x.as_slice(), classifier.as_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_not_requested_is_scalar() {
        assert_eq!(KernelFlavor::resolve(false), KernelFlavor::Scalar);
    }

    #[cfg(not(feature = "simd"))]
    #[test]
    fn test_resolve_without_simd_feature_falls_back() {
        assert_eq!(KernelFlavor::resolve(true), KernelFlavor::Scalar);
    }

    #[test]
    fn test_cpu_backend_classify() {
        let backend = CpuBackend::default();
        let mut logits = backend.allocate(2).unwrap();
        let x = HostBuffer::from(vec![1.0, 2.0, 3.0]);
        let w = HostBuffer::from(vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        backend.classify(&mut logits, &x, &w).unwrap();
        assert_eq!(logits.as_slice(), &[1.0, 5.0]);
    }

    #[test]
    fn test_allocate_from_copies() {
        let backend = CpuBackend::default();
        let buf = backend.allocate_from(&[1.0, 2.0]).unwrap();
        assert_eq!(buf.as_slice(), &[1.0, 2.0]);
    }
}
