//! Launch-configuration memoization
//!
//! Deriving a group size costs a driver round trip, and re-binding unchanged
//! kernel arguments costs one call per argument. The cache keeps the derived
//! configuration per operation and the last binding per kernel so a steady
//! decode loop only pays for append/execute/synchronize.

use std::collections::HashMap;
use std::ffi::c_void;

use super::error::{ZeError, ZeResult};
use super::ffi::ZeGroupCount;
use super::memory::SharedBuffer;

/// Names one logical dispatch site (kernel plus its role in the pipeline)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(&'static str);

impl OpId {
    /// Final projection onto the vocabulary
    pub const CLASSIFIER: OpId = OpId("classifier");

    pub const fn new(name: &'static str) -> Self {
        OpId(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

/// Value bound to one kernel argument slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// USM address
    Pointer(usize),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl KernelArg {
    pub fn buffer(buf: &SharedBuffer) -> Self {
        KernelArg::Pointer(buf.device_ptr() as usize)
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            KernelArg::Pointer(_) => std::mem::size_of::<*mut c_void>(),
            KernelArg::I32(_) => std::mem::size_of::<i32>(),
            KernelArg::U32(_) => std::mem::size_of::<u32>(),
            KernelArg::F32(_) => std::mem::size_of::<f32>(),
        }
    }

    /// Call `f` with a pointer to the argument value, valid for the call.
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(*const c_void) -> R) -> R {
        match *self {
            KernelArg::Pointer(addr) => {
                let p = addr as *mut c_void;
                f(&p as *const *mut c_void as *const c_void)
            }
            KernelArg::I32(v) => f(&v as *const i32 as *const c_void),
            KernelArg::U32(v) => f(&v as *const u32 as *const c_void),
            KernelArg::F32(v) => f(&v as *const f32 as *const c_void),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub group_size: [u32; 3],
    pub group_count: ZeGroupCount,
    pub thread_count: u32,
}

impl DispatchConfig {
    /// 1-D launch of `thread_count` work items in groups of `group_size`.
    pub fn derive(thread_count: u32, group_size: [u32; 3]) -> ZeResult<Self> {
        let gx = group_size[0];
        if thread_count == 0 || gx == 0 {
            return Err(ZeError::InvalidDispatch(format!(
                "thread count {} with group size {}",
                thread_count, gx
            )));
        }
        if thread_count % gx != 0 {
            return Err(ZeError::InvalidDispatch(format!(
                "thread count {} is not a multiple of group size {}",
                thread_count, gx
            )));
        }
        Ok(Self {
            group_size,
            group_count: ZeGroupCount {
                group_count_x: thread_count / gx,
                group_count_y: 1,
                group_count_z: 1,
            },
            thread_count,
        })
    }
}

#[derive(Debug, Default)]
struct KernelBinding {
    group_size: Option<[u32; 3]>,
    args: Vec<Option<KernelArg>>,
}

/// What a launch must do to the kernel before appending it
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub config: DispatchConfig,
    pub set_group_size: bool,
    /// Argument slots whose bound value differs from the request
    pub rebind: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct DispatchCache {
    configs: HashMap<OpId, DispatchConfig>,
    kernels: HashMap<usize, KernelBinding>,
    hits: u64,
    misses: u64,
}

impl DispatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the configuration for `op` and diff the kernel's current
    /// binding against `args`.
    ///
    /// `suggest` is only called when `op` has no entry or was last seen with
    /// a different thread count.
    pub fn plan(
        &mut self,
        kernel_id: usize,
        op: OpId,
        thread_count: u32,
        args: &[KernelArg],
        suggest: impl FnOnce(u32) -> ZeResult<[u32; 3]>,
    ) -> ZeResult<LaunchPlan> {
        let config = match self.configs.get(&op).copied() {
            Some(cfg) if cfg.thread_count == thread_count => {
                self.hits += 1;
                cfg
            }
            cached => {
                if let Some(old) = cached {
                    tracing::debug!(
                        "dispatch {}: thread count changed {} -> {}",
                        op.name(),
                        old.thread_count,
                        thread_count
                    );
                }
                self.misses += 1;
                let cfg = DispatchConfig::derive(thread_count, suggest(thread_count)?)?;
                tracing::debug!(
                    "dispatch {}: group size {:?}, {} groups",
                    op.name(),
                    cfg.group_size,
                    cfg.group_count.group_count_x
                );
                self.configs.insert(op, cfg);
                cfg
            }
        };

        let binding = self.kernels.get(&kernel_id);
        let set_group_size = binding.and_then(|b| b.group_size) != Some(config.group_size);
        let rebind = args
            .iter()
            .enumerate()
            .filter(|(i, arg)| {
                binding
                    .and_then(|b| b.args.get(*i).copied().flatten())
                    .map_or(true, |bound| bound != **arg)
            })
            .map(|(i, _)| i as u32)
            .collect();

        Ok(LaunchPlan {
            config,
            set_group_size,
            rebind,
        })
    }

    /// Record that `plan` was applied to the kernel.
    pub fn commit(&mut self, kernel_id: usize, plan: &LaunchPlan, args: &[KernelArg]) {
        let binding = self.kernels.entry(kernel_id).or_default();
        binding.group_size = Some(plan.config.group_size);
        if binding.args.len() < args.len() {
            binding.args.resize(args.len(), None);
        }
        for &i in &plan.rebind {
            binding.args[i as usize] = Some(args[i as usize]);
        }
    }

    /// Drop what is known about a kernel's binding, after a failed bind or
    /// when the kernel is destroyed.
    pub fn forget_kernel(&mut self, kernel_id: usize) {
        self.kernels.remove(&kernel_id);
    }

    /// Kernels with a recorded binding
    pub fn bound_kernels(&self) -> usize {
        self.kernels.len()
    }

    pub fn get(&self, op: OpId) -> Option<&DispatchConfig> {
        self.configs.get(&op)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// (hits, misses) of configuration lookups
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
