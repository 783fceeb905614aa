//! Level Zero error types

use std::fmt;

use thiserror::Error;

use super::ffi;

/// Raw `ze_result_t` with its symbolic name for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZeStatus(pub u32);

impl ZeStatus {
    pub const SUCCESS: ZeStatus = ZeStatus(ffi::ZE_RESULT_SUCCESS);

    pub fn is_success(self) -> bool {
        self.0 == ffi::ZE_RESULT_SUCCESS
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            ffi::ZE_RESULT_SUCCESS => "ZE_RESULT_SUCCESS",
            ffi::ZE_RESULT_NOT_READY => "ZE_RESULT_NOT_READY",
            ffi::ZE_RESULT_ERROR_DEVICE_LOST => "ZE_RESULT_ERROR_DEVICE_LOST",
            ffi::ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY => "ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY",
            ffi::ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY => "ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY",
            ffi::ZE_RESULT_ERROR_MODULE_BUILD_FAILURE => "ZE_RESULT_ERROR_MODULE_BUILD_FAILURE",
            ffi::ZE_RESULT_ERROR_MODULE_LINK_FAILURE => "ZE_RESULT_ERROR_MODULE_LINK_FAILURE",
            ffi::ZE_RESULT_ERROR_INSUFFICIENT_PERMISSIONS => {
                "ZE_RESULT_ERROR_INSUFFICIENT_PERMISSIONS"
            }
            ffi::ZE_RESULT_ERROR_NOT_AVAILABLE => "ZE_RESULT_ERROR_NOT_AVAILABLE",
            ffi::ZE_RESULT_ERROR_UNINITIALIZED => "ZE_RESULT_ERROR_UNINITIALIZED",
            ffi::ZE_RESULT_ERROR_UNSUPPORTED_VERSION => "ZE_RESULT_ERROR_UNSUPPORTED_VERSION",
            ffi::ZE_RESULT_ERROR_UNSUPPORTED_FEATURE => "ZE_RESULT_ERROR_UNSUPPORTED_FEATURE",
            ffi::ZE_RESULT_ERROR_INVALID_ARGUMENT => "ZE_RESULT_ERROR_INVALID_ARGUMENT",
            ffi::ZE_RESULT_ERROR_INVALID_NULL_HANDLE => "ZE_RESULT_ERROR_INVALID_NULL_HANDLE",
            ffi::ZE_RESULT_ERROR_INVALID_NULL_POINTER => "ZE_RESULT_ERROR_INVALID_NULL_POINTER",
            ffi::ZE_RESULT_ERROR_INVALID_SIZE => "ZE_RESULT_ERROR_INVALID_SIZE",
            ffi::ZE_RESULT_ERROR_UNSUPPORTED_SIZE => "ZE_RESULT_ERROR_UNSUPPORTED_SIZE",
            ffi::ZE_RESULT_ERROR_UNSUPPORTED_ALIGNMENT => "ZE_RESULT_ERROR_UNSUPPORTED_ALIGNMENT",
            ffi::ZE_RESULT_ERROR_INVALID_ENUMERATION => "ZE_RESULT_ERROR_INVALID_ENUMERATION",
            ffi::ZE_RESULT_ERROR_INVALID_NATIVE_BINARY => "ZE_RESULT_ERROR_INVALID_NATIVE_BINARY",
            ffi::ZE_RESULT_ERROR_INVALID_KERNEL_NAME => "ZE_RESULT_ERROR_INVALID_KERNEL_NAME",
            ffi::ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION => {
                "ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION"
            }
            ffi::ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_INDEX => {
                "ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_INDEX"
            }
            ffi::ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_SIZE => {
                "ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_SIZE"
            }
            ffi::ZE_RESULT_ERROR_UNKNOWN => "ZE_RESULT_ERROR_UNKNOWN",
            _ => "ZE_RESULT_UNRECOGNIZED",
        }
    }
}

impl fmt::Display for ZeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self.name(), self.0)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ZeError {
    #[error("Level Zero loader unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("Level Zero symbol {symbol} missing: {reason}")]
    SymbolMissing { symbol: String, reason: String },
    #[error("{op} failed: {status}")]
    DriverCall { op: &'static str, status: ZeStatus },
    #[error("No Level Zero driver found")]
    NoDriver,
    #[error("Device index {index} out of range ({available} devices)")]
    NoDevice { index: usize, available: usize },
    #[error("Device has no compute-capable command queue group")]
    NoComputeQueueGroup,
    #[error("Failed to read kernel binary {path}: {reason}")]
    KernelBinary { path: String, reason: String },
    #[error("Module build failed: {status}\n{log}")]
    ModuleBuild { status: ZeStatus, log: String },
    #[error("Invalid name {0:?}: contains an interior NUL")]
    InvalidName(String),
    #[error("Invalid dispatch: {0}")]
    InvalidDispatch(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for ZeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ZeError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

pub type ZeResult<T> = Result<T, ZeError>;

/// Map a driver return code to `Ok` or a [`ZeError::DriverCall`] naming `op`.
pub fn check(result: ffi::ze_result_t, op: &'static str) -> ZeResult<()> {
    let status = ZeStatus(result);
    if status.is_success() {
        Ok(())
    } else {
        tracing::error!("{} returned {}", op, status);
        Err(ZeError::DriverCall { op, status })
    }
}

impl ZeError {
    /// Device lost and out-of-memory conditions; everything else is a setup
    /// or programming error.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            ZeError::DriverCall {
                status: ZeStatus(
                    ffi::ZE_RESULT_ERROR_DEVICE_LOST
                        | ffi::ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY
                        | ffi::ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY
                ),
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_names_code() {
        let status = ZeStatus(0x7800_0004);
        assert_eq!(
            status.to_string(),
            "ZE_RESULT_ERROR_INVALID_ARGUMENT (0x78000004)"
        );
        assert_eq!(ZeStatus(0x1234).name(), "ZE_RESULT_UNRECOGNIZED");
    }

    #[test]
    fn test_check() {
        assert!(check(0, "zeInit").is_ok());
        let err = check(0x7000_0001, "zeCommandQueueSynchronize").unwrap_err();
        assert!(err.is_device_fault());
        let msg = err.to_string();
        assert!(msg.contains("zeCommandQueueSynchronize"));
        assert!(msg.contains("ZE_RESULT_ERROR_DEVICE_LOST"));
    }

    #[test]
    fn test_build_failure_not_device_fault() {
        let err = ZeError::ModuleBuild {
            status: ZeStatus(0x7000_0004),
            log: "error: undefined symbol".to_string(),
        };
        assert!(!err.is_device_fault());
        assert!(err.to_string().contains("undefined symbol"));
    }
}
