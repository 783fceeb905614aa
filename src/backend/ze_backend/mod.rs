//! Level Zero GPU backend
//!
//! The loader is opened at runtime, so builds without the oneAPI stack still
//! link; [`ZeRuntime::is_available`] reports whether a device can be used.

pub mod backend;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ffi;
pub mod memory;
pub mod module;
pub mod queue;
pub mod runtime;

pub use backend::{ZeBackend, MATMUL_KERNEL};
pub use device::{ApiVersion, DeviceInfo};
pub use dispatch::{DispatchCache, DispatchConfig, KernelArg, OpId};
pub use error::{ZeError, ZeResult, ZeStatus};
pub use event::KernelTiming;
pub use memory::SharedBuffer;
pub use module::{ZeKernel, ZeModule};
pub use runtime::{RuntimePhase, ZeRuntime};
