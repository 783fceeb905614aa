//! [`ComputeBackend`] over the Level Zero runtime

use std::sync::Arc;

use super::dispatch::{KernelArg, OpId};
use super::memory::SharedBuffer;
use super::module::ZeKernel;
use super::runtime::ZeRuntime;
use crate::backend::config::BackendConfig;
use crate::backend::cpu::KernelFlavor;
use crate::backend::{ComputeBackend, FloatBuffer};
use crate::error::{ForgeResult, ZeForgeError};

/// Entry point of the matrix-vector kernel in the module
pub const MATMUL_KERNEL: &str = "matMul";

/// Host stages on the CPU kernels, classifier projection on the device.
///
/// Buffers are shared USM, so the host stages read and write them directly
/// and the device kernel sees the same memory.
#[derive(Debug)]
pub struct ZeBackend {
    matmul: ZeKernel,
    runtime: Arc<ZeRuntime>,
    flavor: KernelFlavor,
}

impl ZeBackend {
    /// Use the process-wide runtime, initializing it on first use.
    pub fn new(config: &BackendConfig) -> ForgeResult<Self> {
        let runtime = ZeRuntime::shared(config)?;
        Self::with_runtime(runtime, config)
    }

    pub fn with_runtime(runtime: Arc<ZeRuntime>, config: &BackendConfig) -> ForgeResult<Self> {
        let matmul = runtime.create_kernel(MATMUL_KERNEL)?;
        Ok(Self {
            matmul,
            runtime,
            flavor: KernelFlavor::resolve(config.vector_kernels),
        })
    }

    pub fn runtime(&self) -> &Arc<ZeRuntime> {
        &self.runtime
    }
}

impl Drop for ZeBackend {
    fn drop(&mut self) {
        self.runtime.release_kernel(&self.matmul);
    }
}

impl ComputeBackend for ZeBackend {
    type Buffer = SharedBuffer;

    fn name(&self) -> &'static str {
        "level-zero"
    }

    fn flavor(&self) -> KernelFlavor {
        self.flavor
    }

    fn allocate(&self, len: usize) -> ForgeResult<SharedBuffer> {
        Ok(self.runtime.allocate(len)?)
    }

    fn classify(
        &self,
        logits: &mut SharedBuffer,
        x: &SharedBuffer,
        classifier: &SharedBuffer,
    ) -> ForgeResult<()> {
        let n = x.len();
        let d = logits.len();
        if classifier.len() != n * d {
            return Err(ZeForgeError::InvalidConfiguration(format!(
                "classifier has {} elements, expected {} x {}",
                classifier.len(),
                d,
                n
            )));
        }
        let n = i32::try_from(n).map_err(|_| {
            ZeForgeError::InvalidConfiguration(format!("row length {} exceeds i32", n))
        })?;
        let threads = u32::try_from(d).map_err(|_| {
            ZeForgeError::InvalidConfiguration(format!("vocabulary {} exceeds u32", d))
        })?;
        let args = [
            KernelArg::buffer(logits),
            KernelArg::buffer(x),
            KernelArg::buffer(classifier),
            KernelArg::I32(n),
        ];
        self.runtime
            .launch(&self.matmul, OpId::CLASSIFIER, &args, threads)?;
        Ok(())
    }
}
