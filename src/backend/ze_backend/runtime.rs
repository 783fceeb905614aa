//! Level Zero compute runtime
//!
//! Owns the driver objects for one device and runs kernels synchronously:
//! every [`ZeRuntime::launch`] appends to a single command list, closes it,
//! executes it on the compute queue, waits, and resets the list. Launches are
//! serialized by a mutex; nothing is in flight between calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;

use super::device::{DeviceInfo, ZeContext, ZeDevice, ZeDriver};
use super::dispatch::{DispatchCache, KernelArg, OpId};
use super::error::{ZeError, ZeResult};
use super::event::{KernelTiming, Profiler};
use super::ffi::{self, ZeApi};
use super::memory::{HostAllocation, SharedBuffer};
use super::module::{ZeKernel, ZeModule};
use super::queue::{ZeCommandList, ZeCommandQueue};
use crate::backend::config::BackendConfig;

/// Whether a launch is currently between append and reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    Idle,
    Dispatching,
}

struct LaunchState {
    list: ZeCommandList,
    queue: ZeCommandQueue,
    cache: DispatchCache,
    profiler: Option<Profiler>,
    last_timing: Option<KernelTiming>,
}

pub struct ZeRuntime {
    launch: Mutex<LaunchState>,
    timestamps: OnceCell<HostAllocation>,
    dispatching: AtomicBool,
    module: ZeModule,
    device: ZeDevice,
    driver: ZeDriver,
    context: Arc<ZeContext>,
}

static SHARED_RUNTIME: OnceCell<Arc<ZeRuntime>> = OnceCell::new();

impl ZeRuntime {
    /// Bring up driver, device, context, queue, command list and module.
    ///
    /// Objects created before a failing step are released in reverse order
    /// as their owners drop.
    pub fn initialize(config: &BackendConfig) -> ZeResult<Self> {
        tracing::info!(
            "initializing Level Zero runtime (device {}, kernels {})",
            config.device_index,
            config.kernel_path.display()
        );
        let api = ZeApi::shared()?;
        let driver = ZeDriver::first(&api)?;
        let device = ZeDevice::select(&api, &driver, config.device_index)?;
        let context = Arc::new(ZeContext::create(Arc::clone(&api), &driver)?);
        let ordinal = device.compute_queue_ordinal(&api)?;
        let queue = ZeCommandQueue::create(&context, &device, ordinal)?;
        let list = ZeCommandList::create(&context, &device, ordinal)?;
        let module = ZeModule::load(
            &context,
            &device,
            &config.kernel_path,
            config.module_format,
            &config.build_flags,
        )?;
        let profiler = if config.profile {
            Some(Profiler::new(&context, &device)?)
        } else {
            None
        };

        tracing::info!(
            "Level Zero runtime ready: API {}, {}",
            driver.api_version,
            device.info.name
        );
        Ok(Self {
            launch: Mutex::new(LaunchState {
                list,
                queue,
                cache: DispatchCache::new(),
                profiler,
                last_timing: None,
            }),
            timestamps: OnceCell::new(),
            dispatching: AtomicBool::new(false),
            module,
            device,
            driver,
            context,
        })
    }

    /// Process-wide runtime, initialized by the first caller.
    ///
    /// Later callers get the existing runtime regardless of their config.
    pub fn shared(config: &BackendConfig) -> ZeResult<Arc<ZeRuntime>> {
        SHARED_RUNTIME
            .get_or_try_init(|| Self::initialize(config).map(Arc::new))
            .map(Arc::clone)
    }

    /// True when a loader, a driver and at least one device are present.
    pub fn is_available() -> bool {
        match ZeApi::shared() {
            Ok(api) => ZeDevice::count(&api) > 0,
            Err(e) => {
                tracing::debug!("Level Zero unavailable: {}", e);
                false
            }
        }
    }

    /// Zero-filled shared buffer of `len` floats.
    ///
    /// The first allocation also sets up the timestamp scratch region.
    pub fn allocate(&self, len: usize) -> ZeResult<SharedBuffer> {
        self.timestamp_buffer()?;
        SharedBuffer::zeroed(&self.context, &self.device, len)
    }

    pub fn create_kernel(&self, name: &str) -> ZeResult<ZeKernel> {
        self.module.kernel(name)
    }

    /// Run `kernel` over `thread_count` work items and wait for it.
    ///
    /// The group size for `op` is derived once and reused while the thread
    /// count stays the same; arguments are only re-bound when they change.
    pub fn launch(
        &self,
        kernel: &ZeKernel,
        op: OpId,
        args: &[KernelArg],
        thread_count: u32,
    ) -> ZeResult<()> {
        let mut state = self.launch.lock()?;
        let plan = state.cache.plan(kernel.id(), op, thread_count, args, |n| {
            kernel.suggest_group_size(n)
        })?;

        if let Err(e) = bind(kernel, &plan, args) {
            state.cache.forget_kernel(kernel.id());
            return Err(e);
        }
        state.cache.commit(kernel.id(), &plan, args);

        self.dispatching.store(true, Ordering::Release);
        let result = self.submit(&mut state, kernel, &plan.config.group_count);
        self.dispatching.store(false, Ordering::Release);
        result
    }

    fn submit(
        &self,
        state: &mut LaunchState,
        kernel: &ZeKernel,
        groups: &ffi::ZeGroupCount,
    ) -> ZeResult<()> {
        let timestamps = match state.profiler {
            Some(_) => Some(self.timestamp_buffer()?),
            None => None,
        };
        let signal = state.profiler.as_ref().map(Profiler::event);

        let appended = state.list.append_launch(kernel, groups, signal).and_then(|()| {
            match (signal, timestamps) {
                (Some(event), Some(dst)) => state.list.append_query_timestamps(event, dst.as_ptr()),
                _ => Ok(()),
            }
        });
        let run = appended
            .and_then(|()| state.list.close())
            .and_then(|()| state.queue.execute(&state.list))
            .and_then(|()| state.queue.synchronize());
        // The list must be reusable even after a failed append or execute.
        let reset = state.list.reset();
        run?;
        reset?;

        if let (Some(profiler), Some(dst)) = (state.profiler.as_ref(), timestamps) {
            // SAFETY: the queue has synchronized, so the device write is done;
            // the region was sized for one result.
            let raw: ffi::ZeKernelTimestampResult = unsafe { dst.read() };
            let timing = KernelTiming::from_result(&raw, &self.device.info);
            tracing::debug!(
                "kernel {} took {:?} (context {:?})",
                kernel.name(),
                timing.global,
                timing.context
            );
            state.last_timing = Some(timing);
            profiler.event().host_reset()?;
        }
        Ok(())
    }

    fn timestamp_buffer(&self) -> ZeResult<&HostAllocation> {
        self.timestamps.get_or_try_init(|| {
            HostAllocation::new(
                &self.context,
                std::mem::size_of::<ffi::ZeKernelTimestampResult>(),
            )
        })
    }

    /// Forget the dispatch binding of a kernel that is about to be dropped.
    pub fn release_kernel(&self, kernel: &ZeKernel) {
        match self.launch.lock() {
            Ok(mut state) => state.cache.forget_kernel(kernel.id()),
            Err(_) => tracing::warn!("launch lock poisoned; binding of {} kept", kernel.name()),
        }
    }

    /// Kernels the dispatch cache holds bindings for
    pub fn bound_kernels(&self) -> ZeResult<usize> {
        Ok(self.launch.lock()?.cache.bound_kernels())
    }

    pub fn phase(&self) -> RuntimePhase {
        if self.dispatching.load(Ordering::Acquire) {
            RuntimePhase::Dispatching
        } else {
            RuntimePhase::Idle
        }
    }

    /// Device time of the most recent launch, when profiling is on
    pub fn last_kernel_time(&self) -> Option<Duration> {
        self.launch
            .lock()
            .ok()
            .and_then(|state| state.last_timing.map(|t| t.global))
    }

    /// Configuration lookups served from the cache, and those derived
    pub fn dispatch_stats(&self) -> ZeResult<(u64, u64)> {
        Ok(self.launch.lock()?.cache.stats())
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device.info
    }

    pub fn api_version(&self) -> super::device::ApiVersion {
        self.driver.api_version
    }
}

fn bind(kernel: &ZeKernel, plan: &super::dispatch::LaunchPlan, args: &[KernelArg]) -> ZeResult<()> {
    if plan.set_group_size {
        kernel.set_group_size(plan.config.group_size)?;
    }
    for &index in &plan.rebind {
        let arg = args
            .get(index as usize)
            .ok_or_else(|| ZeError::InvalidDispatch(format!("argument {} missing", index)))?;
        // SAFETY: with_value yields a pointer to a local of exactly
        // `arg.size()` bytes; the launch mutex is held by the caller.
        arg.with_value(|value| unsafe { kernel.set_argument(index, arg.size(), value) })?;
    }
    Ok(())
}

impl std::fmt::Debug for ZeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZeRuntime")
            .field("device", &self.device.info.name)
            .field("api_version", &self.driver.api_version)
            .field("phase", &self.phase())
            .finish()
    }
}
