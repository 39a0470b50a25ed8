//! Control node ownership
//!
//! [`DeviceHandle`] owns the file descriptor of the gih control node. The
//! descriptor exists exactly while the handle is open; dropping the handle
//! or calling [`DeviceHandle::close`] releases it, which makes the driver
//! stop capturing interrupts.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{GihError, Result};

/// Result of a successful [`DeviceHandle::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new descriptor was opened
    Opened,
    /// The handle was already open; the existing descriptor is kept
    AlreadyOpen,
}

/// How [`DeviceHandle::write_raw`] hands data to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Wait until the driver accepted the whole buffer, then flush
    Blocking,
    /// Single attempt; a full driver buffer surfaces as `WouldBlock`
    NonBlocking,
}

/// Bounds on a blocking write against a stalled driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(1),
        }
    }
}

/// Exclusive owner of the control node descriptor
#[derive(Debug)]
pub struct DeviceHandle {
    path: PathBuf,
    file: Option<File>,
    policy: WritePolicy,
}

impl DeviceHandle {
    /// Create a closed handle for the control node at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_policy(path, WritePolicy::default())
    }

    pub fn with_policy(path: impl Into<PathBuf>, policy: WritePolicy) -> Self {
        Self {
            path: path.into(),
            file: None,
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// Open the control node write-only and non-blocking.
    ///
    /// Opening an open handle succeeds with [`OpenOutcome::AlreadyOpen`]
    /// and never creates a second descriptor.
    ///
    /// # Errors
    /// `NotFound` if the node does not exist, `PermissionDenied` without
    /// sufficient privilege.
    pub fn open(&mut self) -> Result<OpenOutcome> {
        if self.file.is_some() {
            warn!("{} already opened", self.path.display());
            return Ok(OpenOutcome::AlreadyOpen);
        }

        info!("Opening gih device {}", self.path.display());
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| GihError::from_io(e, &self.path))?;

        self.file = Some(file);
        Ok(OpenOutcome::Opened)
    }

    /// Release the descriptor. Closing a closed handle succeeds.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                info!("Closing gih device {}", self.path.display());
                drop(file);
            }
            None => warn!("{} is not opened", self.path.display()),
        }
        Ok(())
    }

    /// Borrow the open descriptor for a control operation
    pub(crate) fn fd(&self) -> Result<BorrowedFd<'_>> {
        self.file.as_ref().map(|f| f.as_fd()).ok_or(GihError::NotOpen)
    }

    /// Hand `bytes` to the driver.
    ///
    /// Only reachable through [`crate::Controller::write`], which checks that
    /// the device is armed.
    pub(crate) fn write_raw(&mut self, bytes: &[u8], mode: WriteMode) -> Result<usize> {
        let policy = self.policy;
        let path = &self.path;
        let file = self.file.as_mut().ok_or(GihError::NotOpen)?;

        let written = match mode {
            WriteMode::NonBlocking => file.write(bytes).map_err(|e| GihError::from_io(e, path))?,
            WriteMode::Blocking => write_blocking(file, bytes, policy, path)?,
        };
        debug!("{} bytes written to gih ({:?})", written, mode);
        Ok(written)
    }
}

fn write_blocking(file: &mut File, bytes: &[u8], policy: WritePolicy, path: &Path) -> Result<usize> {
    let deadline = Instant::now() + policy.timeout;
    let mut written = 0;

    while written < bytes.len() {
        match file.write(&bytes[written..]) {
            Ok(0) => return Err(GihError::Io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(GihError::TimedOut {
                        written,
                        timeout: policy.timeout,
                    });
                }
                thread::sleep(policy.retry_interval);
            }
            Err(e) => return Err(GihError::from_io(e, path)),
        }
    }

    file.flush().map_err(|e| GihError::from_io(e, path))?;
    Ok(written)
}
