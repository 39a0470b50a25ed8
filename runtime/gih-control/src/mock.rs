//! ⚠️  MOCK capabilities for testing without the gih module
//!
//! [`MockBackend`] stands in for the native configuration shim and
//! [`MockBinding`] for `insmod`/`rmmod`. Both record every call and return
//! configurable outcomes, so the lifecycle can be exercised without root
//! privilege or a kernel module.
//!
//! Only compiled for tests or with the `mock` feature.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};

use crate::config::{ConfigBackend, ConfigFields, Field, FieldValue};
use crate::driver::DriverBinding;

/// A call received by [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Apply(FieldValue),
    Start,
    Stop,
}

/// Configuration backend that echoes what it is given unless told otherwise
#[derive(Debug, Default)]
pub struct MockBackend {
    calls: Vec<MockCall>,
    echoes: HashMap<Field, i64>,
    failing: ConfigFields,
    start_status: i32,
    stop_status: i32,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `echo` for every later application of `field`
    pub fn set_echo(&mut self, field: Field, echo: i64) {
        self.echoes.insert(field, echo);
    }

    /// Fail every later application of `field` with an I/O error
    pub fn fail(&mut self, field: Field) {
        self.failing |= field.flag();
    }

    /// Go back to echoing `field` faithfully
    pub fn heal(&mut self, field: Field) {
        self.failing.remove(field.flag());
        self.echoes.remove(&field);
    }

    pub fn set_start_status(&mut self, status: i32) {
        self.start_status = status;
    }

    pub fn set_stop_status(&mut self, status: i32) {
        self.stop_status = status;
    }

    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }

    pub fn starts(&self) -> usize {
        self.calls.iter().filter(|c| **c == MockCall::Start).count()
    }

    pub fn stops(&self) -> usize {
        self.calls.iter().filter(|c| **c == MockCall::Stop).count()
    }
}

impl ConfigBackend for MockBackend {
    fn apply(&mut self, _fd: BorrowedFd<'_>, value: &FieldValue) -> io::Result<i64> {
        self.calls.push(MockCall::Apply(value.clone()));

        let field = value.field();
        if self.failing.contains(field.flag()) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(self
            .echoes
            .get(&field)
            .copied()
            .or_else(|| value.expected_echo())
            .unwrap_or(-1))
    }

    fn start(&mut self, _fd: BorrowedFd<'_>) -> io::Result<i32> {
        self.calls.push(MockCall::Start);
        Ok(self.start_status)
    }

    fn stop(&mut self, _fd: BorrowedFd<'_>) -> io::Result<i32> {
        self.calls.push(MockCall::Stop);
        Ok(self.stop_status)
    }
}

/// Module binding that records loads and unloads
#[derive(Debug)]
pub struct MockBinding {
    succeed: bool,
    loaded: Vec<PathBuf>,
    unloaded: Vec<String>,
}

impl Default for MockBinding {
    fn default() -> Self {
        Self {
            succeed: true,
            loaded: Vec::new(),
            unloaded: Vec::new(),
        }
    }
}

impl MockBinding {
    /// A binding whose every load and unload fails
    pub fn failing() -> Self {
        Self {
            succeed: false,
            ..Self::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loaded.len()
    }

    pub fn unloads(&self) -> usize {
        self.unloaded.len()
    }

    pub fn loaded_modules(&self) -> &[PathBuf] {
        &self.loaded
    }
}

impl DriverBinding for MockBinding {
    fn load(&mut self, module: &Path) -> bool {
        if self.succeed {
            self.loaded.push(module.to_path_buf());
        }
        self.succeed
    }

    fn unload(&mut self, name: &str) -> bool {
        if self.succeed {
            self.unloaded.push(name.to_string());
        }
        self.succeed
    }
}
