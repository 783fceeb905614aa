//! Kernel module and kernel wrappers

use std::ffi::{c_char, CString};
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::device::{ZeContext, ZeDevice};
use super::error::{check, ZeError, ZeResult, ZeStatus};
use super::ffi;
use crate::backend::config::ModuleFormat;

struct ModuleInner {
    handle: ffi::ZeModuleHandle,
    context: Arc<ZeContext>,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        // SAFETY: kernels hold an Arc to this module, so none are alive here.
        let result = unsafe { (self.context.api().module_destroy)(self.handle) };
        tracing::debug!("ZeModule::drop: zeModuleDestroy returned {}", result);
    }
}

/// A built kernel module. Cloning shares the same driver object.
#[derive(Clone)]
pub struct ZeModule {
    inner: Arc<ModuleInner>,
}

// SAFETY: module handles are immutable after build; destruction happens once
// when the last Arc drops.
unsafe impl Send for ModuleInner {}
unsafe impl Sync for ModuleInner {}

impl ZeModule {
    /// Read a precompiled binary from disk and build it for `device`.
    pub fn load(
        context: &Arc<ZeContext>,
        device: &ZeDevice,
        path: &Path,
        format: ModuleFormat,
        build_flags: &str,
    ) -> ZeResult<Self> {
        let binary = std::fs::read(path).map_err(|e| ZeError::KernelBinary {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(
            "ZeModule::load: {} ({} bytes, {:?})",
            path.display(),
            binary.len(),
            format
        );
        Self::build(context, device, &binary, format, build_flags)
    }

    /// Build a module from an in-memory binary.
    ///
    /// On failure the driver's build log is attached to the error.
    pub fn build(
        context: &Arc<ZeContext>,
        device: &ZeDevice,
        binary: &[u8],
        format: ModuleFormat,
        build_flags: &str,
    ) -> ZeResult<Self> {
        let flags = CString::new(build_flags)
            .map_err(|_| ZeError::InvalidName(build_flags.to_string()))?;
        let desc = ffi::ZeModuleDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_MODULE_DESC,
            p_next: ptr::null(),
            format: match format {
                ModuleFormat::Spirv => ffi::ZE_MODULE_FORMAT_IL_SPIRV,
                ModuleFormat::Native => ffi::ZE_MODULE_FORMAT_NATIVE,
            },
            input_size: binary.len(),
            p_input_module: binary.as_ptr(),
            p_build_flags: flags.as_ptr(),
            p_constants: ptr::null(),
        };

        let api = context.api();
        let mut handle = ptr::null_mut();
        let mut build_log = ptr::null_mut();
        // SAFETY: desc, binary and flags outlive the call.
        let result = unsafe {
            (api.module_create)(
                context.as_ptr(),
                device.as_ptr(),
                &desc,
                &mut handle,
                &mut build_log,
            )
        };
        let log = read_build_log(context, build_log);

        if result != ffi::ZE_RESULT_SUCCESS {
            tracing::error!("zeModuleCreate failed: {}\n{}", ZeStatus(result), log);
            return Err(ZeError::ModuleBuild {
                status: ZeStatus(result),
                log,
            });
        }
        if !log.trim().is_empty() {
            tracing::debug!("module build log:\n{}", log);
        }
        tracing::debug!("ZeModule::build: module={:?}", handle);
        Ok(Self {
            inner: Arc::new(ModuleInner {
                handle,
                context: Arc::clone(context),
            }),
        })
    }

    /// Create `name` from this module with the large-SLM cache preference.
    pub fn kernel(&self, name: &str) -> ZeResult<ZeKernel> {
        let c_name = CString::new(name).map_err(|_| ZeError::InvalidName(name.to_string()))?;
        let desc = ffi::ZeKernelDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_KERNEL_DESC,
            p_next: ptr::null(),
            flags: 0,
            p_kernel_name: c_name.as_ptr(),
        };
        let api = self.inner.context.api();
        let mut handle = ptr::null_mut();
        // SAFETY: desc and name outlive the call.
        check(
            unsafe { (api.kernel_create)(self.inner.handle, &desc, &mut handle) },
            "zeKernelCreate",
        )?;
        let kernel = ZeKernel {
            handle,
            id: next_kernel_id(),
            name: name.to_string(),
            module: Arc::clone(&self.inner),
        };
        // SAFETY: handle was just created.
        check(
            unsafe { (api.kernel_set_cache_config)(handle, ffi::ZE_CACHE_CONFIG_FLAG_LARGE_SLM) },
            "zeKernelSetCacheConfig",
        )?;
        tracing::debug!("ZeModule::kernel: created {} ({:?})", name, handle);
        Ok(kernel)
    }

    pub fn as_ptr(&self) -> ffi::ZeModuleHandle {
        self.inner.handle
    }
}

impl fmt::Debug for ZeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeModule")
            .field("handle", &self.inner.handle)
            .finish()
    }
}

static NEXT_KERNEL_ID: AtomicUsize = AtomicUsize::new(1);

/// Driver handles get recycled after `zeKernelDestroy`; these ids never are.
fn next_kernel_id() -> usize {
    NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed)
}

fn read_build_log(context: &ZeContext, log: ffi::ZeModuleBuildLogHandle) -> String {
    if log.is_null() {
        return String::new();
    }
    let api = context.api();
    let mut size = 0usize;
    // SAFETY: null buffer queries the size only.
    let mut text = String::new();
    if unsafe { (api.module_build_log_get_string)(log, &mut size, ptr::null_mut()) }
        == ffi::ZE_RESULT_SUCCESS
        && size > 0
    {
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` holds `size` bytes as requested.
        let result = unsafe {
            (api.module_build_log_get_string)(log, &mut size, buf.as_mut_ptr() as *mut c_char)
        };
        if result == ffi::ZE_RESULT_SUCCESS {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            text = String::from_utf8_lossy(&buf[..end]).into_owned();
        }
    }
    // SAFETY: log handle came from zeModuleCreate and is destroyed once.
    unsafe { (api.module_build_log_destroy)(log) };
    text
}

/// Kernel object. Argument and group-size state lives on the driver object,
/// so the runtime only mutates it under its launch lock.
pub struct ZeKernel {
    handle: ffi::ZeKernelHandle,
    id: usize,
    name: String,
    module: Arc<ModuleInner>,
}

// SAFETY: the driver kernel state (arguments, group size) is only modified
// by ZeRuntime::launch while it holds the launch mutex.
unsafe impl Send for ZeKernel {}
unsafe impl Sync for ZeKernel {}

impl ZeKernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> ffi::ZeKernelHandle {
        self.handle
    }

    /// Process-unique identity for the dispatch cache
    pub fn id(&self) -> usize {
        self.id
    }

    /// Driver-recommended group size for a 1-D launch of `thread_count`
    pub(crate) fn suggest_group_size(&self, thread_count: u32) -> ZeResult<[u32; 3]> {
        let (mut x, mut y, mut z) = (0u32, 0u32, 0u32);
        // SAFETY: out-params outlive the call.
        check(
            unsafe {
                (self.api().kernel_suggest_group_size)(
                    self.handle,
                    thread_count,
                    1,
                    1,
                    &mut x,
                    &mut y,
                    &mut z,
                )
            },
            "zeKernelSuggestGroupSize",
        )?;
        Ok([x, y, z])
    }

    pub(crate) fn set_group_size(&self, size: [u32; 3]) -> ZeResult<()> {
        // SAFETY: caller holds the runtime launch lock.
        check(
            unsafe { (self.api().kernel_set_group_size)(self.handle, size[0], size[1], size[2]) },
            "zeKernelSetGroupSize",
        )
    }

    /// # Safety
    /// `value` must point to `size` readable bytes and the caller must hold the
    /// runtime launch lock.
    pub(crate) unsafe fn set_argument(
        &self,
        index: u32,
        size: usize,
        value: *const std::ffi::c_void,
    ) -> ZeResult<()> {
        check(
            (self.api().kernel_set_argument_value)(self.handle, index, size, value),
            "zeKernelSetArgumentValue",
        )
    }

    fn api(&self) -> &ffi::ZeApi {
        self.module.context.api()
    }
}

impl fmt::Debug for ZeKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeKernel")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for ZeKernel {
    fn drop(&mut self) {
        // SAFETY: created by zeKernelCreate, destroyed once, module still alive.
        let result = unsafe { (self.api().kernel_destroy)(self.handle) };
        tracing::debug!("ZeKernel::drop: {} zeKernelDestroy returned {}", self.name, result);
    }
}
