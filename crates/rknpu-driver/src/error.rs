//! Error types for NPU driver operations

use thiserror::Error;

/// Result type alias for NPU operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Linux errno values returned across the device-file boundary.
pub mod errno {
    /// No such entry.
    pub const ENOENT: i32 = 2;
    /// I/O error.
    pub const EIO: i32 = 5;
    /// Out of memory.
    pub const ENOMEM: i32 = 12;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Timer expired.
    pub const ETIMEDOUT: i32 = 110;
}

/// Errors that can occur during NPU operations
#[derive(Debug, Error)]
pub enum NpuError {
    /// Malformed or out-of-range request; rejected before any side effect
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request
        reason: String,
    },

    /// Coherent memory or mapping could not be obtained
    #[error("Allocation failed: {reason}")]
    Allocation {
        /// Reason for failure
        reason: String,
    },

    /// External buffer handle could not be imported
    #[error("Import failed: {reason}")]
    Import {
        /// Reason for failure
        reason: String,
    },

    /// Referenced object does not exist (or was already destroyed)
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing object
        what: String,
    },

    /// Job did not complete within its deadline
    #[error("Job timeout after {duration_ms}ms (task counter {task_counter})")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
        /// Tasks the hardware reported complete before the deadline
        task_counter: u32,
    },

    /// Hardware reported a condition that required a soft reset
    #[error("Device fault: {reason}")]
    DeviceFault {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while mapping a register window
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl NpuError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an allocation error
    pub fn allocation(reason: impl Into<String>) -> Self {
        Self::Allocation {
            reason: reason.into(),
        }
    }

    /// Create an import error
    pub fn import(reason: impl Into<String>) -> Self {
        Self::Import {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a device fault error
    pub fn device_fault(reason: impl Into<String>) -> Self {
        Self::DeviceFault {
            reason: reason.into(),
        }
    }

    /// Errno equivalent, as the ioctl boundary reports it.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } | Self::Import { .. } => errno::EINVAL,
            Self::Allocation { .. } => errno::ENOMEM,
            Self::NotFound { .. } => errno::ENOENT,
            Self::Timeout { .. } => errno::ETIMEDOUT,
            Self::DeviceFault { .. } => errno::EIO,
            Self::Io { source } => source.raw_os_error().unwrap_or(errno::EIO),
        }
    }

    /// Partial task counter carried by a timeout.
    pub fn task_counter(&self) -> Option<u32> {
        match self {
            Self::Timeout { task_counter, .. } => Some(*task_counter),
            _ => None,
        }
    }
}
