//! Controller settings
//!
//! Node paths, read caps and write timeouts, loadable from a TOML file:
//!
//! ```toml
//! control_node = "/dev/gih"
//! log_nodes = ["/dev/gihlog0", "/dev/gihlog1", "/dev/gihlog2"]
//! max_log_bytes = 2097152
//! module_path = "gih.ko"
//! module_name = "gih"
//! write_timeout_ms = 5000
//! write_retry_interval_ms = 1
//! ```
//!
//! Every key is optional.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::WritePolicy;
use crate::driver::DEFAULT_MODULE_NAME;
use crate::logs::DEFAULT_MAX_LOG_BYTES;
use crate::{GihError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Control node the configuration and payload go through
    pub control_node: PathBuf,
    /// Interrupt, workqueue-entry and workqueue-exit log nodes
    pub log_nodes: [PathBuf; 3],
    /// Upper bound on one read of a log node
    pub max_log_bytes: usize,
    /// Module object passed to `insmod`
    pub module_path: PathBuf,
    /// Module name passed to `rmmod`
    pub module_name: String,
    pub write_timeout_ms: u64,
    pub write_retry_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_node: PathBuf::from("/dev/gih"),
            log_nodes: [
                PathBuf::from("/dev/gihlog0"),
                PathBuf::from("/dev/gihlog1"),
                PathBuf::from("/dev/gihlog2"),
            ],
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            module_path: PathBuf::from("gih.ko"),
            module_name: DEFAULT_MODULE_NAME.to_string(),
            write_timeout_ms: 5000,
            write_retry_interval_ms: 1,
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text).map_err(|e| GihError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| GihError::from_io(e, path))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GihError::Settings(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_log_bytes == 0 {
            return Err(GihError::Settings("max_log_bytes must be positive".to_string()));
        }
        if self.write_timeout_ms == 0 {
            return Err(GihError::Settings("write_timeout_ms must be positive".to_string()));
        }
        if self.write_retry_interval_ms == 0 {
            return Err(GihError::Settings("write_retry_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            timeout: Duration::from_millis(self.write_timeout_ms),
            retry_interval: Duration::from_millis(self.write_retry_interval_ms),
        }
    }
}
