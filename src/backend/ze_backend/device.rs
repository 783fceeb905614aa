//! Driver, device and context discovery

use std::ffi::CStr;
use std::fmt;
use std::ptr;
use std::sync::Arc;

use super::error::{check, ZeError, ZeResult};
use super::ffi::{self, ZeApi};

/// `major.minor` as reported by `zeDriverGetApiVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: raw >> 16,
            minor: raw & 0x0000_ffff,
        }
    }

    pub fn raw(self) -> u32 {
        ffi::make_version(self.major, self.minor)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Driver handles are owned by the loader and never destroyed.
#[derive(Debug, Clone, Copy)]
pub struct ZeDriver {
    handle: ffi::ZeDriverHandle,
    pub api_version: ApiVersion,
}

// SAFETY: driver handles are immutable loader-owned identifiers.
unsafe impl Send for ZeDriver {}
unsafe impl Sync for ZeDriver {}

impl ZeDriver {
    /// First driver the loader reports
    pub fn first(api: &ZeApi) -> ZeResult<Self> {
        let mut count = 0u32;
        // SAFETY: a null handle array queries the count only.
        check(
            unsafe { (api.driver_get)(&mut count, ptr::null_mut()) },
            "zeDriverGet",
        )?;
        if count == 0 {
            return Err(ZeError::NoDriver);
        }
        let mut drivers = vec![ptr::null_mut(); count as usize];
        // SAFETY: `drivers` holds `count` slots.
        check(
            unsafe { (api.driver_get)(&mut count, drivers.as_mut_ptr()) },
            "zeDriverGet",
        )?;
        let handle = drivers[0];

        let mut raw_version = 0u32;
        // SAFETY: handle came from zeDriverGet.
        check(
            unsafe { (api.driver_get_api_version)(handle, &mut raw_version) },
            "zeDriverGetApiVersion",
        )?;
        let api_version = ApiVersion::from_raw(raw_version);
        tracing::debug!("Level Zero driver API version {} ({} drivers)", api_version, count);
        Ok(Self {
            handle,
            api_version,
        })
    }

    pub fn as_ptr(&self) -> ffi::ZeDriverHandle {
        self.handle
    }
}

/// The device properties the runtime cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub core_clock_mhz: u32,
    pub max_mem_alloc_size: u64,
    pub eu_count: u32,
    /// Nanoseconds per timestamp tick
    pub timer_resolution: u64,
    pub kernel_timestamp_valid_bits: u32,
}

impl DeviceInfo {
    fn from_properties(props: &ffi::ZeDeviceProperties) -> Self {
        // SAFETY: the driver NUL-terminates `name` within its fixed buffer.
        let name = unsafe { CStr::from_ptr(props.name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Self {
            name,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            core_clock_mhz: props.core_clock_rate,
            max_mem_alloc_size: props.max_mem_alloc_size,
            eu_count: props.num_slices
                * props.num_subslices_per_slice
                * props.num_eus_per_subslice,
            timer_resolution: props.timer_resolution.max(1),
            kernel_timestamp_valid_bits: props.kernel_timestamp_valid_bits,
        }
    }

    /// Convert a timestamp interval to nanoseconds, allowing for one
    /// wrap of the counter.
    pub fn ticks_to_ns(&self, start: u64, end: u64) -> u64 {
        let ticks = if end >= start {
            end - start
        } else if self.kernel_timestamp_valid_bits > 0 && self.kernel_timestamp_valid_bits < 64 {
            let wrap = 1u64 << self.kernel_timestamp_valid_bits;
            (wrap - start) + end
        } else {
            0
        };
        ticks.saturating_mul(self.timer_resolution)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (vendor 0x{:04x}, device 0x{:04x}, {} EUs @ {} MHz, max alloc {} MiB)",
            self.name,
            self.vendor_id,
            self.device_id,
            self.eu_count,
            self.core_clock_mhz,
            self.max_mem_alloc_size / (1024 * 1024)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ZeDevice {
    handle: ffi::ZeDeviceHandle,
    pub info: DeviceInfo,
}

// SAFETY: device handles are immutable driver-owned identifiers.
unsafe impl Send for ZeDevice {}
unsafe impl Sync for ZeDevice {}

impl ZeDevice {
    /// Device `index` of `driver`, with its properties queried
    pub fn select(api: &ZeApi, driver: &ZeDriver, index: usize) -> ZeResult<Self> {
        let mut count = 0u32;
        // SAFETY: a null handle array queries the count only.
        check(
            unsafe { (api.device_get)(driver.as_ptr(), &mut count, ptr::null_mut()) },
            "zeDeviceGet",
        )?;
        if index >= count as usize {
            return Err(ZeError::NoDevice {
                index,
                available: count as usize,
            });
        }
        let mut devices = vec![ptr::null_mut(); count as usize];
        // SAFETY: `devices` holds `count` slots.
        check(
            unsafe { (api.device_get)(driver.as_ptr(), &mut count, devices.as_mut_ptr()) },
            "zeDeviceGet",
        )?;
        let handle = devices[index];

        let mut props = ffi::ZeDeviceProperties::new();
        // SAFETY: props carries the matching stype and lives across the call.
        check(
            unsafe { (api.device_get_properties)(handle, &mut props) },
            "zeDeviceGetProperties",
        )?;
        let info = DeviceInfo::from_properties(&props);
        tracing::info!("Level Zero device {}: {}", index, info);
        Ok(Self { handle, info })
    }

    /// Number of devices on the first driver, or 0 when no driver is present
    pub fn count(api: &ZeApi) -> usize {
        let Ok(driver) = ZeDriver::first(api) else {
            return 0;
        };
        let mut count = 0u32;
        // SAFETY: a null handle array queries the count only.
        let result = unsafe { (api.device_get)(driver.as_ptr(), &mut count, ptr::null_mut()) };
        if result == ffi::ZE_RESULT_SUCCESS {
            count as usize
        } else {
            0
        }
    }

    /// Ordinal of the first queue group advertising compute
    pub fn compute_queue_ordinal(&self, api: &ZeApi) -> ZeResult<u32> {
        let mut count = 0u32;
        // SAFETY: null properties array queries the count only.
        check(
            unsafe {
                (api.device_get_command_queue_group_properties)(
                    self.handle,
                    &mut count,
                    ptr::null_mut(),
                )
            },
            "zeDeviceGetCommandQueueGroupProperties",
        )?;
        let mut groups = vec![ffi::ZeCommandQueueGroupProperties::new(); count as usize];
        // SAFETY: `groups` holds `count` initialized descriptors.
        check(
            unsafe {
                (api.device_get_command_queue_group_properties)(
                    self.handle,
                    &mut count,
                    groups.as_mut_ptr(),
                )
            },
            "zeDeviceGetCommandQueueGroupProperties",
        )?;
        let ordinal = groups
            .iter()
            .position(|g| g.flags & ffi::ZE_COMMAND_QUEUE_GROUP_PROPERTY_FLAG_COMPUTE != 0)
            .ok_or(ZeError::NoComputeQueueGroup)?;
        tracing::debug!(
            "compute queue group ordinal {} ({} queues)",
            ordinal,
            groups[ordinal].num_queues
        );
        Ok(ordinal as u32)
    }

    pub fn as_ptr(&self) -> ffi::ZeDeviceHandle {
        self.handle
    }
}

/// Owned `ze_context_handle_t`; destroyed when the last holder drops.
pub struct ZeContext {
    api: Arc<ZeApi>,
    handle: ffi::ZeContextHandle,
}

// SAFETY: Level Zero contexts are free-threaded; only destruction mutates
// and that happens once, in Drop.
unsafe impl Send for ZeContext {}
unsafe impl Sync for ZeContext {}

impl ZeContext {
    pub fn create(api: Arc<ZeApi>, driver: &ZeDriver) -> ZeResult<Self> {
        let desc = ffi::ZeContextDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_CONTEXT_DESC,
            p_next: ptr::null(),
            flags: 0,
        };
        let mut handle = ptr::null_mut();
        // SAFETY: desc and handle outlive the call.
        check(
            unsafe { (api.context_create)(driver.as_ptr(), &desc, &mut handle) },
            "zeContextCreate",
        )?;
        tracing::debug!("ZeContext::create: context={:?}", handle);
        Ok(Self { api, handle })
    }

    pub fn api(&self) -> &ZeApi {
        &self.api
    }

    pub fn api_arc(&self) -> Arc<ZeApi> {
        Arc::clone(&self.api)
    }

    pub fn as_ptr(&self) -> ffi::ZeContextHandle {
        self.handle
    }
}

impl fmt::Debug for ZeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeContext").field("handle", &self.handle).finish()
    }
}

impl Drop for ZeContext {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: every child object holds an Arc to this context, so none
            // are alive here.
            let result = unsafe { (self.api.context_destroy)(self.handle) };
            tracing::debug!("ZeContext::drop: zeContextDestroy returned {}", result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_roundtrip() {
        let v = ApiVersion::from_raw(0x0001_0005);
        assert_eq!(v, ApiVersion { major: 1, minor: 5 });
        assert_eq!(v.raw(), 0x0001_0005);
        assert_eq!(v.to_string(), "1.5");
    }

    fn info(resolution: u64, bits: u32) -> DeviceInfo {
        DeviceInfo {
            name: "test".into(),
            vendor_id: 0x8086,
            device_id: 0x56a0,
            core_clock_mhz: 2400,
            max_mem_alloc_size: 4 << 30,
            eu_count: 512,
            timer_resolution: resolution,
            kernel_timestamp_valid_bits: bits,
        }
    }

    #[test]
    fn test_ticks_to_ns() {
        let dev = info(52, 32);
        assert_eq!(dev.ticks_to_ns(100, 110), 520);
    }

    #[test]
    fn test_ticks_to_ns_wraps_once() {
        let dev = info(1, 32);
        let start = (1u64 << 32) - 5;
        assert_eq!(dev.ticks_to_ns(start, 3), 8);
    }

    #[test]
    fn test_display_mentions_name() {
        assert!(info(1, 32).to_string().starts_with("test (vendor 0x8086"));
    }
}
