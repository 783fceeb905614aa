//! Level Zero FFI surface
//!
//! Only the entry points the runtime calls are declared. They are resolved
//! from the loader library at runtime (libloading) instead of link time, so
//! the crate builds and its CPU path runs on machines without a GPU stack.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use libloading::Library;
use once_cell::sync::OnceCell;

use super::error::{check, ZeError, ZeResult};

pub type ze_result_t = u32;

pub type ZeDriverHandle = *mut c_void;
pub type ZeDeviceHandle = *mut c_void;
pub type ZeContextHandle = *mut c_void;
pub type ZeCommandQueueHandle = *mut c_void;
pub type ZeCommandListHandle = *mut c_void;
pub type ZeModuleHandle = *mut c_void;
pub type ZeModuleBuildLogHandle = *mut c_void;
pub type ZeKernelHandle = *mut c_void;
pub type ZeEventPoolHandle = *mut c_void;
pub type ZeEventHandle = *mut c_void;
pub type ZeFenceHandle = *mut c_void;

// ---- result codes (subset used for diagnostics) ----
pub const ZE_RESULT_SUCCESS: ze_result_t = 0;
pub const ZE_RESULT_NOT_READY: ze_result_t = 1;
pub const ZE_RESULT_ERROR_DEVICE_LOST: ze_result_t = 0x7000_0001;
pub const ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY: ze_result_t = 0x7000_0002;
pub const ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY: ze_result_t = 0x7000_0003;
pub const ZE_RESULT_ERROR_MODULE_BUILD_FAILURE: ze_result_t = 0x7000_0004;
pub const ZE_RESULT_ERROR_MODULE_LINK_FAILURE: ze_result_t = 0x7000_0005;
pub const ZE_RESULT_ERROR_INSUFFICIENT_PERMISSIONS: ze_result_t = 0x7001_0000;
pub const ZE_RESULT_ERROR_NOT_AVAILABLE: ze_result_t = 0x7001_0001;
pub const ZE_RESULT_ERROR_UNINITIALIZED: ze_result_t = 0x7800_0001;
pub const ZE_RESULT_ERROR_UNSUPPORTED_VERSION: ze_result_t = 0x7800_0002;
pub const ZE_RESULT_ERROR_UNSUPPORTED_FEATURE: ze_result_t = 0x7800_0003;
pub const ZE_RESULT_ERROR_INVALID_ARGUMENT: ze_result_t = 0x7800_0004;
pub const ZE_RESULT_ERROR_INVALID_NULL_HANDLE: ze_result_t = 0x7800_0005;
pub const ZE_RESULT_ERROR_INVALID_NULL_POINTER: ze_result_t = 0x7800_0007;
pub const ZE_RESULT_ERROR_INVALID_SIZE: ze_result_t = 0x7800_0008;
pub const ZE_RESULT_ERROR_UNSUPPORTED_SIZE: ze_result_t = 0x7800_0009;
pub const ZE_RESULT_ERROR_UNSUPPORTED_ALIGNMENT: ze_result_t = 0x7800_000a;
pub const ZE_RESULT_ERROR_INVALID_ENUMERATION: ze_result_t = 0x7800_000c;
pub const ZE_RESULT_ERROR_INVALID_NATIVE_BINARY: ze_result_t = 0x7800_000f;
pub const ZE_RESULT_ERROR_INVALID_KERNEL_NAME: ze_result_t = 0x7800_0011;
pub const ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION: ze_result_t = 0x7800_0013;
pub const ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_INDEX: ze_result_t = 0x7800_0015;
pub const ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_SIZE: ze_result_t = 0x7800_0016;
pub const ZE_RESULT_ERROR_UNKNOWN: ze_result_t = 0x7fff_fffe;

// ---- structure types ----
pub const ZE_STRUCTURE_TYPE_DEVICE_PROPERTIES: u32 = 0x3;
pub const ZE_STRUCTURE_TYPE_COMMAND_QUEUE_GROUP_PROPERTIES: u32 = 0x6;
pub const ZE_STRUCTURE_TYPE_CONTEXT_DESC: u32 = 0xd;
pub const ZE_STRUCTURE_TYPE_COMMAND_QUEUE_DESC: u32 = 0xe;
pub const ZE_STRUCTURE_TYPE_COMMAND_LIST_DESC: u32 = 0xf;
pub const ZE_STRUCTURE_TYPE_EVENT_POOL_DESC: u32 = 0x10;
pub const ZE_STRUCTURE_TYPE_EVENT_DESC: u32 = 0x11;
pub const ZE_STRUCTURE_TYPE_DEVICE_MEM_ALLOC_DESC: u32 = 0x15;
pub const ZE_STRUCTURE_TYPE_HOST_MEM_ALLOC_DESC: u32 = 0x16;
pub const ZE_STRUCTURE_TYPE_MODULE_DESC: u32 = 0x1b;
pub const ZE_STRUCTURE_TYPE_KERNEL_DESC: u32 = 0x1d;
pub const ZE_STRUCTURE_TYPE_RELAXED_ALLOCATION_LIMITS_EXP_DESC: u32 = 0x0002_0001;

// ---- flags and enums ----
pub const ZE_INIT_FLAG_GPU_ONLY: u32 = 1;
pub const ZE_COMMAND_QUEUE_GROUP_PROPERTY_FLAG_COMPUTE: u32 = 1;
pub const ZE_COMMAND_QUEUE_MODE_ASYNCHRONOUS: u32 = 2;
pub const ZE_COMMAND_QUEUE_PRIORITY_NORMAL: u32 = 0;
pub const ZE_MODULE_FORMAT_IL_SPIRV: u32 = 0;
pub const ZE_MODULE_FORMAT_NATIVE: u32 = 1;
pub const ZE_CACHE_CONFIG_FLAG_LARGE_SLM: u32 = 1;
pub const ZE_HOST_MEM_ALLOC_FLAG_BIAS_CACHED: u32 = 1;
pub const ZE_RELAXED_ALLOCATION_LIMITS_EXP_FLAG_MAX_SIZE: u32 = 1;
pub const ZE_EVENT_POOL_FLAG_HOST_VISIBLE: u32 = 1;
pub const ZE_EVENT_POOL_FLAG_KERNEL_TIMESTAMP: u32 = 4;
pub const ZE_EVENT_SCOPE_FLAG_HOST: u32 = 4;
pub const ZE_MAX_DEVICE_NAME: usize = 256;
pub const ZE_MAX_DEVICE_UUID_SIZE: usize = 16;

#[repr(C)]
pub struct ZeContextDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub flags: u32,
}

#[repr(C)]
pub struct ZeCommandQueueDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub ordinal: u32,
    pub index: u32,
    pub flags: u32,
    pub mode: u32,
    pub priority: u32,
}

#[repr(C)]
pub struct ZeCommandListDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub command_queue_group_ordinal: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZeCommandQueueGroupProperties {
    pub stype: u32,
    pub p_next: *mut c_void,
    pub flags: u32,
    pub max_memory_fill_pattern_size: usize,
    pub num_queues: u32,
}

impl ZeCommandQueueGroupProperties {
    pub fn new() -> Self {
        Self {
            stype: ZE_STRUCTURE_TYPE_COMMAND_QUEUE_GROUP_PROPERTIES,
            p_next: std::ptr::null_mut(),
            flags: 0,
            max_memory_fill_pattern_size: 0,
            num_queues: 0,
        }
    }
}

#[repr(C)]
pub struct ZeModuleDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub format: u32,
    pub input_size: usize,
    pub p_input_module: *const u8,
    pub p_build_flags: *const c_char,
    pub p_constants: *const c_void,
}

#[repr(C)]
pub struct ZeKernelDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub p_kernel_name: *const c_char,
}

#[repr(C)]
pub struct ZeDeviceMemAllocDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub ordinal: u32,
}

#[repr(C)]
pub struct ZeHostMemAllocDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub flags: u32,
}

#[repr(C)]
pub struct ZeRelaxedAllocationLimitsExpDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZeGroupCount {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

#[repr(C)]
pub struct ZeEventPoolDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub flags: u32,
    pub count: u32,
}

#[repr(C)]
pub struct ZeEventDesc {
    pub stype: u32,
    pub p_next: *const c_void,
    pub index: u32,
    pub signal: u32,
    pub wait: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeKernelTimestampData {
    pub kernel_start: u64,
    pub kernel_end: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeKernelTimestampResult {
    pub global: ZeKernelTimestampData,
    pub context: ZeKernelTimestampData,
}

#[repr(C)]
pub struct ZeDeviceProperties {
    pub stype: u32,
    pub p_next: *mut c_void,
    pub device_type: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub flags: u32,
    pub subdevice_id: u32,
    pub core_clock_rate: u32,
    pub max_mem_alloc_size: u64,
    pub max_hardware_contexts: u32,
    pub max_command_queue_priority: u32,
    pub num_threads_per_eu: u32,
    pub physical_eu_simd_width: u32,
    pub num_eus_per_subslice: u32,
    pub num_subslices_per_slice: u32,
    pub num_slices: u32,
    pub timer_resolution: u64,
    pub timestamp_valid_bits: u32,
    pub kernel_timestamp_valid_bits: u32,
    pub uuid: [u8; ZE_MAX_DEVICE_UUID_SIZE],
    pub name: [c_char; ZE_MAX_DEVICE_NAME],
}

impl ZeDeviceProperties {
    pub fn new() -> Self {
        Self {
            stype: ZE_STRUCTURE_TYPE_DEVICE_PROPERTIES,
            p_next: std::ptr::null_mut(),
            device_type: 0,
            vendor_id: 0,
            device_id: 0,
            flags: 0,
            subdevice_id: 0,
            core_clock_rate: 0,
            max_mem_alloc_size: 0,
            max_hardware_contexts: 0,
            max_command_queue_priority: 0,
            num_threads_per_eu: 0,
            physical_eu_simd_width: 0,
            num_eus_per_subslice: 0,
            num_subslices_per_slice: 0,
            num_slices: 0,
            timer_resolution: 0,
            timestamp_valid_bits: 0,
            kernel_timestamp_valid_bits: 0,
            uuid: [0; ZE_MAX_DEVICE_UUID_SIZE],
            name: [0; ZE_MAX_DEVICE_NAME],
        }
    }
}

/// Function table resolved from the Level Zero loader.
///
/// Pointers stay valid for as long as `_lib` is alive, which is as long as
/// the table itself.
pub struct ZeApi {
    pub init: unsafe extern "C" fn(u32) -> ze_result_t,
    pub driver_get: unsafe extern "C" fn(*mut u32, *mut ZeDriverHandle) -> ze_result_t,
    pub driver_get_api_version: unsafe extern "C" fn(ZeDriverHandle, *mut u32) -> ze_result_t,
    pub device_get:
        unsafe extern "C" fn(ZeDriverHandle, *mut u32, *mut ZeDeviceHandle) -> ze_result_t,
    pub device_get_properties:
        unsafe extern "C" fn(ZeDeviceHandle, *mut ZeDeviceProperties) -> ze_result_t,
    pub device_get_command_queue_group_properties: unsafe extern "C" fn(
        ZeDeviceHandle,
        *mut u32,
        *mut ZeCommandQueueGroupProperties,
    ) -> ze_result_t,
    pub context_create: unsafe extern "C" fn(
        ZeDriverHandle,
        *const ZeContextDesc,
        *mut ZeContextHandle,
    ) -> ze_result_t,
    pub context_destroy: unsafe extern "C" fn(ZeContextHandle) -> ze_result_t,
    pub command_queue_create: unsafe extern "C" fn(
        ZeContextHandle,
        ZeDeviceHandle,
        *const ZeCommandQueueDesc,
        *mut ZeCommandQueueHandle,
    ) -> ze_result_t,
    pub command_queue_destroy: unsafe extern "C" fn(ZeCommandQueueHandle) -> ze_result_t,
    pub command_queue_execute_command_lists: unsafe extern "C" fn(
        ZeCommandQueueHandle,
        u32,
        *mut ZeCommandListHandle,
        ZeFenceHandle,
    ) -> ze_result_t,
    pub command_queue_synchronize:
        unsafe extern "C" fn(ZeCommandQueueHandle, u64) -> ze_result_t,
    pub command_list_create: unsafe extern "C" fn(
        ZeContextHandle,
        ZeDeviceHandle,
        *const ZeCommandListDesc,
        *mut ZeCommandListHandle,
    ) -> ze_result_t,
    pub command_list_destroy: unsafe extern "C" fn(ZeCommandListHandle) -> ze_result_t,
    pub command_list_close: unsafe extern "C" fn(ZeCommandListHandle) -> ze_result_t,
    pub command_list_reset: unsafe extern "C" fn(ZeCommandListHandle) -> ze_result_t,
    pub command_list_append_launch_kernel: unsafe extern "C" fn(
        ZeCommandListHandle,
        ZeKernelHandle,
        *const ZeGroupCount,
        ZeEventHandle,
        u32,
        *mut ZeEventHandle,
    ) -> ze_result_t,
    pub command_list_append_query_kernel_timestamps: unsafe extern "C" fn(
        ZeCommandListHandle,
        u32,
        *mut ZeEventHandle,
        *mut c_void,
        *const usize,
        ZeEventHandle,
        u32,
        *mut ZeEventHandle,
    ) -> ze_result_t,
    pub module_create: unsafe extern "C" fn(
        ZeContextHandle,
        ZeDeviceHandle,
        *const ZeModuleDesc,
        *mut ZeModuleHandle,
        *mut ZeModuleBuildLogHandle,
    ) -> ze_result_t,
    pub module_destroy: unsafe extern "C" fn(ZeModuleHandle) -> ze_result_t,
    pub module_build_log_get_string:
        unsafe extern "C" fn(ZeModuleBuildLogHandle, *mut usize, *mut c_char) -> ze_result_t,
    pub module_build_log_destroy: unsafe extern "C" fn(ZeModuleBuildLogHandle) -> ze_result_t,
    pub kernel_create: unsafe extern "C" fn(
        ZeModuleHandle,
        *const ZeKernelDesc,
        *mut ZeKernelHandle,
    ) -> ze_result_t,
    pub kernel_destroy: unsafe extern "C" fn(ZeKernelHandle) -> ze_result_t,
    pub kernel_set_cache_config: unsafe extern "C" fn(ZeKernelHandle, u32) -> ze_result_t,
    pub kernel_suggest_group_size: unsafe extern "C" fn(
        ZeKernelHandle,
        u32,
        u32,
        u32,
        *mut u32,
        *mut u32,
        *mut u32,
    ) -> ze_result_t,
    pub kernel_set_group_size:
        unsafe extern "C" fn(ZeKernelHandle, u32, u32, u32) -> ze_result_t,
    pub kernel_set_argument_value:
        unsafe extern "C" fn(ZeKernelHandle, u32, usize, *const c_void) -> ze_result_t,
    pub mem_alloc_shared: unsafe extern "C" fn(
        ZeContextHandle,
        *const ZeDeviceMemAllocDesc,
        *const ZeHostMemAllocDesc,
        usize,
        usize,
        ZeDeviceHandle,
        *mut *mut c_void,
    ) -> ze_result_t,
    pub mem_alloc_host: unsafe extern "C" fn(
        ZeContextHandle,
        *const ZeHostMemAllocDesc,
        usize,
        usize,
        *mut *mut c_void,
    ) -> ze_result_t,
    pub mem_free: unsafe extern "C" fn(ZeContextHandle, *mut c_void) -> ze_result_t,
    pub event_pool_create: unsafe extern "C" fn(
        ZeContextHandle,
        *const ZeEventPoolDesc,
        u32,
        *mut ZeDeviceHandle,
        *mut ZeEventPoolHandle,
    ) -> ze_result_t,
    pub event_pool_destroy: unsafe extern "C" fn(ZeEventPoolHandle) -> ze_result_t,
    pub event_create: unsafe extern "C" fn(
        ZeEventPoolHandle,
        *const ZeEventDesc,
        *mut ZeEventHandle,
    ) -> ze_result_t,
    pub event_destroy: unsafe extern "C" fn(ZeEventHandle) -> ze_result_t,
    pub event_host_reset: unsafe extern "C" fn(ZeEventHandle) -> ze_result_t,
    _lib: Library,
}

/// Loader names tried in order
const LOADER_CANDIDATES: &[&str] = &["libze_loader.so.1", "libze_loader.so", "ze_loader.dll"];

static SHARED_API: OnceCell<Result<Arc<ZeApi>, ZeError>> = OnceCell::new();

impl ZeApi {
    /// Load the loader and call `zeInit` once per process.
    pub fn shared() -> ZeResult<Arc<ZeApi>> {
        SHARED_API
            .get_or_init(|| {
                let api = Self::load()?;
                // SAFETY: zeInit has no preconditions and may be called repeatedly.
                check(unsafe { (api.init)(ZE_INIT_FLAG_GPU_ONLY) }, "zeInit")?;
                tracing::debug!("Level Zero initialized (GPU only)");
                Ok(Arc::new(api))
            })
            .clone()
    }

    fn load() -> ZeResult<Self> {
        let lib = load_loader_library()?;
        Ok(Self {
            init: load_symbol(&lib, b"zeInit\0")?,
            driver_get: load_symbol(&lib, b"zeDriverGet\0")?,
            driver_get_api_version: load_symbol(&lib, b"zeDriverGetApiVersion\0")?,
            device_get: load_symbol(&lib, b"zeDeviceGet\0")?,
            device_get_properties: load_symbol(&lib, b"zeDeviceGetProperties\0")?,
            device_get_command_queue_group_properties: load_symbol(
                &lib,
                b"zeDeviceGetCommandQueueGroupProperties\0",
            )?,
            context_create: load_symbol(&lib, b"zeContextCreate\0")?,
            context_destroy: load_symbol(&lib, b"zeContextDestroy\0")?,
            command_queue_create: load_symbol(&lib, b"zeCommandQueueCreate\0")?,
            command_queue_destroy: load_symbol(&lib, b"zeCommandQueueDestroy\0")?,
            command_queue_execute_command_lists: load_symbol(
                &lib,
                b"zeCommandQueueExecuteCommandLists\0",
            )?,
            command_queue_synchronize: load_symbol(&lib, b"zeCommandQueueSynchronize\0")?,
            command_list_create: load_symbol(&lib, b"zeCommandListCreate\0")?,
            command_list_destroy: load_symbol(&lib, b"zeCommandListDestroy\0")?,
            command_list_close: load_symbol(&lib, b"zeCommandListClose\0")?,
            command_list_reset: load_symbol(&lib, b"zeCommandListReset\0")?,
            command_list_append_launch_kernel: load_symbol(
                &lib,
                b"zeCommandListAppendLaunchKernel\0",
            )?,
            command_list_append_query_kernel_timestamps: load_symbol(
                &lib,
                b"zeCommandListAppendQueryKernelTimestamps\0",
            )?,
            module_create: load_symbol(&lib, b"zeModuleCreate\0")?,
            module_destroy: load_symbol(&lib, b"zeModuleDestroy\0")?,
            module_build_log_get_string: load_symbol(&lib, b"zeModuleBuildLogGetString\0")?,
            module_build_log_destroy: load_symbol(&lib, b"zeModuleBuildLogDestroy\0")?,
            kernel_create: load_symbol(&lib, b"zeKernelCreate\0")?,
            kernel_destroy: load_symbol(&lib, b"zeKernelDestroy\0")?,
            kernel_set_cache_config: load_symbol(&lib, b"zeKernelSetCacheConfig\0")?,
            kernel_suggest_group_size: load_symbol(&lib, b"zeKernelSuggestGroupSize\0")?,
            kernel_set_group_size: load_symbol(&lib, b"zeKernelSetGroupSize\0")?,
            kernel_set_argument_value: load_symbol(&lib, b"zeKernelSetArgumentValue\0")?,
            mem_alloc_shared: load_symbol(&lib, b"zeMemAllocShared\0")?,
            mem_alloc_host: load_symbol(&lib, b"zeMemAllocHost\0")?,
            mem_free: load_symbol(&lib, b"zeMemFree\0")?,
            event_pool_create: load_symbol(&lib, b"zeEventPoolCreate\0")?,
            event_pool_destroy: load_symbol(&lib, b"zeEventPoolDestroy\0")?,
            event_create: load_symbol(&lib, b"zeEventCreate\0")?,
            event_destroy: load_symbol(&lib, b"zeEventDestroy\0")?,
            event_host_reset: load_symbol(&lib, b"zeEventHostReset\0")?,
            _lib: lib,
        })
    }
}

fn load_loader_library() -> ZeResult<Library> {
    for candidate in LOADER_CANDIDATES {
        // SAFETY: probing a shared library; the loader has no init side effects
        // beyond registering drivers.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            tracing::debug!("loaded Level Zero loader {}", candidate);
            return Ok(lib);
        }
    }
    Err(ZeError::LibraryUnavailable(format!(
        "tried {}",
        LOADER_CANDIDATES.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> ZeResult<T> {
    // SAFETY: every call site pairs the symbol with its ze_api.h signature.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|err| ZeError::SymbolMissing {
        symbol: String::from_utf8_lossy(&name[..name.len() - 1]).into_owned(),
        reason: err.to_string(),
    })?;
    Ok(*symbol)
}

/// Pack a Level Zero API version the way `ZE_MAKE_VERSION` does
pub const fn make_version(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor & 0x0000_ffff)
}
