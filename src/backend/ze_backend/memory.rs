//! Unified shared memory buffers

use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use super::device::{ZeContext, ZeDevice};
use super::error::{check, ZeError, ZeResult};
use super::ffi;
use crate::backend::buffer::FloatBuffer;

/// Allocation alignment in bytes (one cache line)
pub const ALLOC_ALIGNMENT: usize = 64;

/// f32 array in shared USM: host code reads and writes it through slices, the
/// device sees the same address in kernel arguments.
pub struct SharedBuffer {
    ptr: NonNull<f32>,
    len: usize,
    context: Arc<ZeContext>,
}

// SAFETY: the allocation is exclusively owned by this value; aliasing follows
// Rust borrows on the slice accessors, and the device only touches it inside a
// launch that borrows the buffer and synchronizes before returning.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Zero-filled buffer of `len` floats.
    ///
    /// Requests relaxed allocation limits so weight tensors larger than the
    /// device's default single-allocation cap still fit.
    pub fn zeroed(context: &Arc<ZeContext>, device: &ZeDevice, len: usize) -> ZeResult<Self> {
        let bytes = len.max(1) * std::mem::size_of::<f32>();
        let relaxed = ffi::ZeRelaxedAllocationLimitsExpDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_RELAXED_ALLOCATION_LIMITS_EXP_DESC,
            p_next: ptr::null(),
            flags: ffi::ZE_RELAXED_ALLOCATION_LIMITS_EXP_FLAG_MAX_SIZE,
        };
        let device_desc = ffi::ZeDeviceMemAllocDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_DEVICE_MEM_ALLOC_DESC,
            p_next: &relaxed as *const _ as *const c_void,
            flags: 0,
            ordinal: 0,
        };
        let host_desc = ffi::ZeHostMemAllocDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_HOST_MEM_ALLOC_DESC,
            p_next: ptr::null(),
            flags: ffi::ZE_HOST_MEM_ALLOC_FLAG_BIAS_CACHED,
        };

        let api = context.api();
        let mut raw: *mut c_void = ptr::null_mut();
        // SAFETY: descriptors (including the chained relaxed-limits struct)
        // outlive the call.
        check(
            unsafe {
                (api.mem_alloc_shared)(
                    context.as_ptr(),
                    &device_desc,
                    &host_desc,
                    bytes,
                    ALLOC_ALIGNMENT,
                    device.as_ptr(),
                    &mut raw,
                )
            },
            "zeMemAllocShared",
        )?;
        let ptr = NonNull::new(raw as *mut f32).ok_or(ZeError::DriverCall {
            op: "zeMemAllocShared",
            status: super::error::ZeStatus(ffi::ZE_RESULT_ERROR_INVALID_NULL_POINTER),
        })?;
        // SAFETY: fresh allocation of at least `len` floats.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        tracing::trace!("SharedBuffer::zeroed: {} floats at {:?}", len, ptr);
        Ok(Self {
            ptr,
            len,
            context: Arc::clone(context),
        })
    }

    /// Address handed to kernels
    pub fn device_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr() as *mut c_void
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f32>()
    }
}

impl FloatBuffer for SharedBuffer {
    fn as_slice(&self) -> &[f32] {
        // SAFETY: `ptr` points to `len` initialized floats owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated by zeMemAllocShared on this context, freed once.
        let result =
            unsafe { (self.context.api().mem_free)(self.context.as_ptr(), self.device_ptr()) };
        if result != ffi::ZE_RESULT_SUCCESS {
            tracing::warn!("SharedBuffer::drop: zeMemFree returned 0x{:08x}", result);
        }
    }
}

/// Host-only USM region the device can write into (timestamp results)
pub struct HostAllocation {
    ptr: NonNull<c_void>,
    size: usize,
    context: Arc<ZeContext>,
}

// SAFETY: owned exclusively; reads happen after queue synchronization.
unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub fn new(context: &Arc<ZeContext>, size: usize) -> ZeResult<Self> {
        let host_desc = ffi::ZeHostMemAllocDesc {
            stype: ffi::ZE_STRUCTURE_TYPE_HOST_MEM_ALLOC_DESC,
            p_next: ptr::null(),
            flags: 0,
        };
        let mut raw: *mut c_void = ptr::null_mut();
        // SAFETY: descriptor outlives the call.
        check(
            unsafe {
                (context.api().mem_alloc_host)(
                    context.as_ptr(),
                    &host_desc,
                    size,
                    ALLOC_ALIGNMENT,
                    &mut raw,
                )
            },
            "zeMemAllocHost",
        )?;
        let ptr = NonNull::new(raw).ok_or(ZeError::DriverCall {
            op: "zeMemAllocHost",
            status: super::error::ZeStatus(ffi::ZE_RESULT_ERROR_INVALID_NULL_POINTER),
        })?;
        // SAFETY: fresh allocation of `size` bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr() as *mut u8, 0, size) };
        tracing::debug!("HostAllocation::new: {} bytes at {:?}", size, ptr);
        Ok(Self {
            ptr,
            size,
            context: Arc::clone(context),
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy out a `T` stored at the start of the region.
    ///
    /// # Safety
    /// `T` must be plain old data no larger than the region, and no device
    /// write may be in flight.
    pub unsafe fn read<T: Copy>(&self) -> T {
        debug_assert!(std::mem::size_of::<T>() <= self.size);
        ptr::read_unaligned(self.ptr.as_ptr() as *const T)
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: allocated by zeMemAllocHost on this context, freed once.
        let result = unsafe { (self.context.api().mem_free)(self.context.as_ptr(), self.as_ptr()) };
        if result != ffi::ZE_RESULT_SUCCESS {
            tracing::warn!("HostAllocation::drop: zeMemFree returned 0x{:08x}", result);
        }
    }
}
