//! gih control - userland controller for the gih interrupt handler driver
//!
//! # Purpose
//! The gih kernel module arms an interrupt line, buffers payload data written
//! by userland and, on every interrupt, defers a write of that data to a
//! workqueue. This crate drives the module from userland: it loads and
//! unloads the module, owns the control node, applies the configuration
//! protocol, and reads back the three event logs the driver records.
//!
//! # Integration Points
//! - Depends on: the gih kernel module (control node `/dev/gih`, log nodes
//!   `/dev/gihlog0..2`)
//! - External capabilities: [`ConfigBackend`] (ioctl translation of one
//!   configuration field) and [`DriverBinding`] (module load/unload)
//! - Provides to: `gihctl` and any embedding application
//!
//! # Architecture
//! ```text
//! DriverBinding -> DeviceHandle -> Controller (configure*, start/stop, write)
//! LogChannels (x3 nodes) -> merge_channels (on demand, read-only)
//! ```
//! All state lives in owned values. A [`Controller`] owns its
//! [`DeviceHandle`] and the [`Configuration`] it has verified against the
//! device; nothing is process-global.
//!
//! # Testing Strategy
//! - Unit tests: state machine transitions, field validation, log decoding,
//!   merge orderings
//! - Integration tests: full lifecycle against the `mock` capabilities with
//!   a regular file standing in for the control node

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod config;
pub mod controller;
pub mod device;
pub mod driver;
pub mod logs;
pub mod reconcile;
pub mod settings;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{ConfigBackend, ConfigFields, Configuration, Field, FieldValue, RunState};
pub use controller::Controller;
pub use device::{DeviceHandle, OpenOutcome, WriteMode, WritePolicy};
pub use driver::{Driver, DriverBinding, ShellBinding};
pub use logs::{read_channel, Channel, LogChannels, LogRecord};
pub use reconcile::{merge_channels, SortKey};
pub use settings::Settings;

/// Error types for gih control operations
#[derive(Debug, Error)]
pub enum GihError {
    #[error("{path} does not exist")]
    NotFound { path: PathBuf },

    #[error("permission denied on {path} (root privilege required for kernel operations)")]
    PermissionDenied { path: PathBuf },

    #[error("device is already running")]
    AlreadyRunning,

    #[error("device is not open")]
    NotOpen,

    #[error("device is not running")]
    NotRunning,

    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: Field, reason: String },

    #[error("device rejected {field}: requested {requested}, device reported {reported}")]
    ConfigurationRejected {
        field: Field,
        requested: String,
        reported: String,
    },

    #[error("configuration incomplete, unset: {unset}")]
    IncompleteConfiguration { unset: ConfigFields },

    #[error("device buffer is full")]
    WouldBlock,

    #[error("blocking write timed out after {timeout:?} ({written} bytes accepted)")]
    TimedOut { written: usize, timeout: Duration },

    #[error("unsupported sort key: {0:?}")]
    UnsupportedSortKey(String),

    #[error("record has no {key}: {line:?}")]
    MalformedRecord { key: &'static str, line: String },

    #[error("{command} command failed: {reason}")]
    CommandFailed { command: &'static str, reason: String },

    #[error("stop command failed earlier, device must be closed")]
    DeviceStopped,

    #[error("device {path} is still open")]
    DeviceStillOpen { path: PathBuf },

    #[error("loading module {module} failed")]
    DriverLoadFailed { module: PathBuf },

    #[error("module {module} is not loaded")]
    DriverNotLoaded { module: String },

    #[error("module {module} was loaded elsewhere, its object path is unknown")]
    ModulePathUnknown { module: String },

    #[error("unloading module {module} failed")]
    DriverUnloadFailed { module: String },

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GihError {
    /// Maps an I/O error raised while touching `path` onto the error kinds
    /// callers are expected to match on.
    pub(crate) fn from_io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => GihError::NotFound { path: path.into() },
            io::ErrorKind::PermissionDenied => GihError::PermissionDenied { path: path.into() },
            io::ErrorKind::WouldBlock => GihError::WouldBlock,
            _ => GihError::Io(err),
        }
    }
}

pub type Result<T> = core::result::Result<T, GihError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = GihError::from_io(io::Error::from(io::ErrorKind::NotFound), "/dev/gih");
        assert!(matches!(err, GihError::NotFound { ref path } if path == &PathBuf::from("/dev/gih")));

        let err = GihError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "/dev/gih");
        assert!(matches!(err, GihError::PermissionDenied { .. }));

        let err = GihError::from_io(io::Error::from(io::ErrorKind::WouldBlock), "/dev/gih");
        assert!(matches!(err, GihError::WouldBlock));

        let err = GihError::from_io(io::Error::from(io::ErrorKind::BrokenPipe), "/dev/gih");
        assert!(matches!(err, GihError::Io(_)));
    }

    #[test]
    fn test_incomplete_configuration_message() {
        let err = GihError::IncompleteConfiguration {
            unset: ConfigFields::IRQ | ConfigFields::OUTPUT_PATH,
        };
        assert_eq!(
            err.to_string(),
            "configuration incomplete, unset: IRQ, output path"
        );
    }
}
