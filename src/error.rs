//! Unified error handling for zeforge
//!
//! All fallibility in the crate is concentrated at two boundaries: model load
//! (header validation, checkpoint slicing) and the Level Zero runtime (driver
//! calls). The decode step itself only fails on caller preconditions, which
//! are checked before any state is touched. Errors are categorized as:
//! - User errors (bad token/position, bad configuration)
//! - Model errors (malformed or truncated checkpoint, I/O)
//! - Backend errors (driver, device, module, dispatch)
//! - Internal errors (poisoned locks, thread pool setup)

use std::fmt;

use crate::backend::ze_backend::ZeError;

/// Unified error type for zeforge
#[derive(Debug, thiserror::Error)]
pub enum ZeForgeError {
    // ========== Model/Loader Errors ==========
    /// A header field or derived quantity is out of range
    #[error("Invalid model config: {field} {reason}")]
    InvalidModelConfig { field: &'static str, reason: String },

    /// Checkpoint is shorter than the declared dimensions require
    #[error("Checkpoint truncated at {field}: need {needed} bytes, {available} available")]
    CheckpointTruncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// Header could not be read at all
    #[error("Invalid checkpoint header: {0}")]
    InvalidHeader(String),

    /// I/O error while opening or mapping a checkpoint
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Decode Preconditions ==========
    /// Position outside `[0, seq_len)`
    #[error("Position {position} out of range for seq_len {seq_len}")]
    PositionOutOfRange { position: usize, seq_len: usize },

    /// Token id outside the vocabulary
    #[error("Token {token} out of range for vocab_size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    /// Position skips over KV cache entries that were never written
    #[error("Position {position} skips unwritten KV cache entries (committed: {committed})")]
    CacheGap { position: usize, committed: usize },

    // ========== Configuration Errors ==========
    /// Backend configuration could not be resolved
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Backend Errors ==========
    /// Level Zero runtime failure
    #[error(transparent)]
    Backend(#[from] ZeError),

    // ========== Internal Errors ==========
    /// CPU thread pool could not be built
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Lock poisoned (indicates a panic in another thread)
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ZeForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ZeForgeError::PositionOutOfRange { .. }
            | ZeForgeError::TokenOutOfRange { .. }
            | ZeForgeError::CacheGap { .. }
            | ZeForgeError::InvalidConfiguration(_) => ErrorCategory::User,

            ZeForgeError::InvalidModelConfig { .. }
            | ZeForgeError::CheckpointTruncated { .. }
            | ZeForgeError::InvalidHeader(_)
            | ZeForgeError::IoError(_) => ErrorCategory::Model,

            ZeForgeError::Backend(_) => ErrorCategory::Backend,

            ZeForgeError::ThreadPool(_) | ZeForgeError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Precondition violations are the only errors a caller can fix and retry.
    /// Load and driver failures are fatal for the process.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is a user-facing error (bad input or configuration)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Malformed or unreadable checkpoint
    Model,
    /// GPU driver or device failure
    Backend,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Model => write!(f, "Model"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ZeForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ZeForgeError::LockPoisoned(err.to_string())
    }
}

// Helper type alias for Results using ZeForgeError
pub type ForgeResult<T> = std::result::Result<T, ZeForgeError>;

/// Build an `InvalidModelConfig` error for a named header field
pub fn config_error(field: &'static str, reason: impl Into<String>) -> ZeForgeError {
    ZeForgeError::InvalidModelConfig {
        field,
        reason: reason.into(),
    }
}
