//! Timestamp events for kernel profiling

use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use super::device::{DeviceInfo, ZeContext, ZeDevice};
use super::error::{check, ZeResult};
use super::ffi;

pub struct ZeEventPool {
    handle: ffi::ZeEventPoolHandle,
    context: Arc<ZeContext>,
}

// SAFETY: pools are only created and destroyed; no shared mutation.
unsafe impl Send for ZeEventPool {}
unsafe impl Sync for ZeEventPool {}

impl ZeEventPool {
    /// Host-visible pool of `count` kernel-timestamp events
    pub fn timestamps(context: &Arc<ZeContext>, device: &ZeDevice, count: u32) -> ZeResult<Self> {
        let desc = ffi::ZeEventPoolDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_EVENT_POOL_DESC,
            p_next: ptr::null(),
            flags: ffi::ZE_EVENT_POOL_FLAG_HOST_VISIBLE | ffi::ZE_EVENT_POOL_FLAG_KERNEL_TIMESTAMP,
            count,
        };
        let mut devices = [device.as_ptr()];
        let mut handle = ptr::null_mut();
        // SAFETY: desc, device array and handle outlive the call.
        check(
            unsafe {
                (context.api().event_pool_create)(
                    context.as_ptr(),
                    &desc,
                    1,
                    devices.as_mut_ptr(),
                    &mut handle,
                )
            },
            "zeEventPoolCreate",
        )?;
        tracing::debug!("ZeEventPool::timestamps: pool={:?} count={}", handle, count);
        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    pub fn event(self: &Arc<Self>, index: u32) -> ZeResult<ZeEvent> {
        let desc = ffi::ZeEventDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_EVENT_DESC,
            p_next: ptr::null(),
            index,
            signal: ffi::ZE_EVENT_SCOPE_FLAG_HOST,
            wait: ffi::ZE_EVENT_SCOPE_FLAG_HOST,
        };
        let mut handle = ptr::null_mut();
        // SAFETY: desc and handle outlive the call.
        check(
            unsafe { (self.context.api().event_create)(self.handle, &desc, &mut handle) },
            "zeEventCreate",
        )?;
        Ok(ZeEvent {
            handle,
            pool: Arc::clone(self),
        })
    }
}

impl Drop for ZeEventPool {
    fn drop(&mut self) {
        // SAFETY: events hold an Arc to the pool, so none are alive here.
        let result = unsafe { (self.context.api().event_pool_destroy)(self.handle) };
        tracing::debug!("ZeEventPool::drop: zeEventPoolDestroy returned {}", result);
    }
}

pub struct ZeEvent {
    handle: ffi::ZeEventHandle,
    pool: Arc<ZeEventPool>,
}

// SAFETY: signalled by the device, reset by the host under the launch lock.
unsafe impl Send for ZeEvent {}
unsafe impl Sync for ZeEvent {}

impl ZeEvent {
    pub fn as_ptr(&self) -> ffi::ZeEventHandle {
        self.handle
    }

    pub fn host_reset(&self) -> ZeResult<()> {
        // SAFETY: the queue has synchronized, so the event is not in use.
        check(
            unsafe { (self.pool.context.api().event_host_reset)(self.handle) },
            "zeEventHostReset",
        )
    }
}

impl Drop for ZeEvent {
    fn drop(&mut self) {
        // SAFETY: created by zeEventCreate, destroyed once.
        unsafe { (self.pool.context.api().event_destroy)(self.handle) };
    }
}

/// One timestamp event reused for every profiled launch
pub struct Profiler {
    event: ZeEvent,
}

impl Profiler {
    pub fn new(context: &Arc<ZeContext>, device: &ZeDevice) -> ZeResult<Self> {
        let pool = Arc::new(ZeEventPool::timestamps(context, device, 1)?);
        Ok(Self {
            event: pool.event(0)?,
        })
    }

    pub fn event(&self) -> &ZeEvent {
        &self.event
    }
}

/// Device execution time of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTiming {
    pub global: Duration,
    pub context: Duration,
}

impl KernelTiming {
    pub fn from_result(result: &ffi::ZeKernelTimestampResult, device: &DeviceInfo) -> Self {
        Self {
            global: Duration::from_nanos(
                device.ticks_to_ns(result.global.kernel_start, result.global.kernel_end),
            ),
            context: Duration::from_nanos(
                device.ticks_to_ns(result.context.kernel_start, result.context.kernel_end),
            ),
        }
    }
}
