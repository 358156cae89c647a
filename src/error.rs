//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures a thermal program can run into, from configuration
//! problems to instrument faults and inconsistent persisted data.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically related to file parsing or
//!   environment overrides that do not match the settings schema.
//! - **`Configuration`**: Semantic errors in a program configuration (duplicate setpoints,
//!   non-positive tolerances, an empty channel set). Fatal at start and never retried.
//! - **`DeviceConnect`**: A device did not answer its connect sequence. The runner retries
//!   these with backoff before giving up.
//! - **`Comm`**: A transient bus fault (timeout, malformed payload). Retried a bounded
//!   number of times by the caller that issued the operation, never by the driver itself.
//! - **`Resume`**: Persisted data cannot be reconciled with the configuration. Requires
//!   operator intervention.
//! - **`Stopped`**: Not a failure. Cooperative cancellation marker that unwinds the loop
//!   when an operator asks the program to stop.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types, keeping
//! the `?` operator usable throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports. [`DaqError::is_retryable`] separates
/// transient device faults from fatal ones.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings parsed but are inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A device could not be opened.
    #[error("Failed to connect to {device}: {reason}")]
    DeviceConnect {
        /// Driver name.
        device: String,
        /// Underlying failure.
        reason: String,
    },

    /// A device did not answer or answered garbage.
    #[error("Communication error with {device}: {reason}")]
    Comm {
        /// Driver name.
        device: String,
        /// Underlying failure.
        reason: String,
    },

    /// Stored data cannot be continued with the current configuration.
    #[error("Cannot resume program: {0}")]
    Resume(String),

    /// Readings could not be persisted or read back.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV data.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The crate was built without the named feature.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The operator stopped the program.
    #[error("Program stopped by operator")]
    Stopped,
}

impl DaqError {
    /// Builds a [`DaqError::Comm`] for the named device.
    pub fn comm(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Comm {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`DaqError::DeviceConnect`] for the named device.
    pub fn connect(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceConnect {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Transient faults that the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Comm { .. } | Self::DeviceConnect { .. })
    }

    /// Re-labels bus level errors with the instrument that issued the call.
    pub fn for_device(self, device: &str) -> Self {
        match self {
            Self::Comm { reason, .. } => Self::comm(device, reason),
            Self::DeviceConnect { reason, .. } => Self::connect(device, reason),
            other => other,
        }
    }

    /// True for the cooperative stop marker.
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}
