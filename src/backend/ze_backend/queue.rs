//! Command queue and command list wrappers

use std::ptr;
use std::sync::Arc;

use super::device::{ZeContext, ZeDevice};
use super::error::{check, ZeResult};
use super::event::ZeEvent;
use super::ffi;
use super::module::ZeKernel;

/// Wait forever in `zeCommandQueueSynchronize`
pub const SYNC_TIMEOUT_INFINITE: u64 = u64::MAX;

pub struct ZeCommandQueue {
    handle: ffi::ZeCommandQueueHandle,
    context: Arc<ZeContext>,
}

// SAFETY: queue submission is externally synchronized by the runtime's
// launch mutex; the handle itself is just an identifier.
unsafe impl Send for ZeCommandQueue {}
unsafe impl Sync for ZeCommandQueue {}

impl ZeCommandQueue {
    /// Asynchronous, normal-priority queue on the compute group `ordinal`
    pub fn create(context: &Arc<ZeContext>, device: &ZeDevice, ordinal: u32) -> ZeResult<Self> {
        let desc = ffi::ZeCommandQueueDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_COMMAND_QUEUE_DESC,
            p_next: ptr::null(),
            ordinal,
            index: 0,
            flags: 0,
            mode: ffi::ZE_COMMAND_QUEUE_MODE_ASYNCHRONOUS,
            priority: ffi::ZE_COMMAND_QUEUE_PRIORITY_NORMAL,
        };
        let mut handle = ptr::null_mut();
        // SAFETY: desc and handle outlive the call.
        check(
            unsafe {
                (context.api().command_queue_create)(
                    context.as_ptr(),
                    device.as_ptr(),
                    &desc,
                    &mut handle,
                )
            },
            "zeCommandQueueCreate",
        )?;
        tracing::debug!("ZeCommandQueue::create: queue={:?} ordinal={}", handle, ordinal);
        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    pub fn execute(&self, list: &ZeCommandList) -> ZeResult<()> {
        let mut lists = [list.as_ptr()];
        // SAFETY: list is closed by the caller; array outlives the call.
        check(
            unsafe {
                (self.context.api().command_queue_execute_command_lists)(
                    self.handle,
                    1,
                    lists.as_mut_ptr(),
                    ptr::null_mut(),
                )
            },
            "zeCommandQueueExecuteCommandLists",
        )
    }

    /// Block until everything submitted has finished.
    pub fn synchronize(&self) -> ZeResult<()> {
        // SAFETY: plain blocking wait on a live queue.
        check(
            unsafe { (self.context.api().command_queue_synchronize)(self.handle, SYNC_TIMEOUT_INFINITE) },
            "zeCommandQueueSynchronize",
        )
    }
}

impl Drop for ZeCommandQueue {
    fn drop(&mut self) {
        // SAFETY: created by zeCommandQueueCreate, destroyed once.
        let result = unsafe { (self.context.api().command_queue_destroy)(self.handle) };
        tracing::debug!("ZeCommandQueue::drop: zeCommandQueueDestroy returned {}", result);
    }
}

/// Reusable command list: append, close, execute, reset.
pub struct ZeCommandList {
    handle: ffi::ZeCommandListHandle,
    context: Arc<ZeContext>,
}

// SAFETY: command lists are not thread-safe in Level Zero; the runtime only
// touches this one while holding its launch mutex.
unsafe impl Send for ZeCommandList {}
unsafe impl Sync for ZeCommandList {}

impl ZeCommandList {
    pub fn create(context: &Arc<ZeContext>, device: &ZeDevice, ordinal: u32) -> ZeResult<Self> {
        let desc = ffi::ZeCommandListDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_COMMAND_LIST_DESC,
            p_next: ptr::null(),
            command_queue_group_ordinal: ordinal,
            flags: 0,
        };
        let mut handle = ptr::null_mut();
        // SAFETY: desc and handle outlive the call.
        check(
            unsafe {
                (context.api().command_list_create)(
                    context.as_ptr(),
                    device.as_ptr(),
                    &desc,
                    &mut handle,
                )
            },
            "zeCommandListCreate",
        )?;
        tracing::debug!("ZeCommandList::create: list={:?}", handle);
        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    pub fn append_launch(
        &self,
        kernel: &ZeKernel,
        groups: &ffi::ZeGroupCount,
        signal: Option<&ZeEvent>,
    ) -> ZeResult<()> {
        let signal = signal.map_or(ptr::null_mut(), ZeEvent::as_ptr);
        // SAFETY: group count outlives the call; kernel arguments were bound
        // under the same lock.
        check(
            unsafe {
                (self.context.api().command_list_append_launch_kernel)(
                    self.handle,
                    kernel.as_ptr(),
                    groups,
                    signal,
                    0,
                    ptr::null_mut(),
                )
            },
            "zeCommandListAppendLaunchKernel",
        )
    }

    /// Copy the timestamps of `event` into `dst` once it signals.
    pub fn append_query_timestamps(&self, event: &ZeEvent, dst: *mut std::ffi::c_void) -> ZeResult<()> {
        let mut events = [event.as_ptr()];
        // SAFETY: `dst` is a host USM allocation large enough for one
        // ze_kernel_timestamp_result_t; events array outlives the call.
        check(
            unsafe {
                (self.context.api().command_list_append_query_kernel_timestamps)(
                    self.handle,
                    1,
                    events.as_mut_ptr(),
                    dst,
                    ptr::null(),
                    ptr::null_mut(),
                    1,
                    events.as_mut_ptr(),
                )
            },
            "zeCommandListAppendQueryKernelTimestamps",
        )
    }

    pub fn close(&self) -> ZeResult<()> {
        // SAFETY: live list, caller holds the launch lock.
        check(
            unsafe { (self.context.api().command_list_close)(self.handle) },
            "zeCommandListClose",
        )
    }

    pub fn reset(&self) -> ZeResult<()> {
        // SAFETY: only called after the queue has synchronized.
        check(
            unsafe { (self.context.api().command_list_reset)(self.handle) },
            "zeCommandListReset",
        )
    }

    pub fn as_ptr(&self) -> ffi::ZeCommandListHandle {
        self.handle
    }
}

impl Drop for ZeCommandList {
    fn drop(&mut self) {
        // SAFETY: created by zeCommandListCreate, destroyed once.
        let result = unsafe { (self.context.api().command_list_destroy)(self.handle) };
        tracing::debug!("ZeCommandList::drop: zeCommandListDestroy returned {}", result);
    }
}
