//! Configuration fields, run states and the configuration capability
//!
//! The gih driver is configured one field at a time through ioctls on the
//! control node. The translation of a field into an ioctl lives outside this
//! crate behind [`ConfigBackend`]; this module defines what a field is, which
//! values are acceptable, and what the device is expected to echo back.

use core::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::{GihError, Result};

/// Longest output path the driver accepts, in bytes (its path buffer holds
/// 128 bytes including the terminator).
pub const MAX_OUTPUT_PATH_LEN: usize = 127;

/// Largest IRQ number the driver's signed `int` parameter holds
pub const MAX_IRQ: u32 = i32::MAX as u32;

/// Largest write size the driver's `unsigned int` parameter holds
pub const MAX_WRITE_SIZE: u64 = u32::MAX as u64;

/// One configurable field of the gih device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Irq,
    Delay,
    WriteSize,
    KeepMissed,
    OutputPath,
}

impl Field {
    /// All fields, in the order they are applied
    pub const ALL: [Field; 5] = [
        Field::Irq,
        Field::Delay,
        Field::WriteSize,
        Field::KeepMissed,
        Field::OutputPath,
    ];

    pub fn flag(self) -> ConfigFields {
        match self {
            Field::Irq => ConfigFields::IRQ,
            Field::Delay => ConfigFields::DELAY,
            Field::WriteSize => ConfigFields::WRITE_SIZE,
            Field::KeepMissed => ConfigFields::KEEP_MISSED,
            Field::OutputPath => ConfigFields::OUTPUT_PATH,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Irq => "IRQ",
            Field::Delay => "delay time",
            Field::WriteSize => "write size",
            Field::KeepMissed => "missed data behavior",
            Field::OutputPath => "output path",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// A set of configuration fields
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConfigFields: u8 {
        const IRQ = 1 << 0;
        const DELAY = 1 << 1;
        const WRITE_SIZE = 1 << 2;
        const KEEP_MISSED = 1 << 3;
        const OUTPUT_PATH = 1 << 4;
    }
}

impl ConfigFields {
    /// Fields in this set, in application order
    pub fn fields(self) -> impl Iterator<Item = Field> {
        Field::ALL.into_iter().filter(move |f| self.contains(f.flag()))
    }
}

impl fmt::Display for ConfigFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in self.fields() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}", field)?;
            first = false;
        }
        Ok(())
    }
}

/// A requested value for one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Interrupt line to capture
    Irq(u32),
    /// Delay between the interrupt and the deferred write, in milliseconds
    Delay(u32),
    /// Bytes written out on each interrupt
    WriteSize(usize),
    /// Append to (true) or replace (false) data still waiting in the buffer
    KeepMissed(bool),
    /// Existing file the driver writes into
    OutputPath(PathBuf),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Irq(_) => Field::Irq,
            FieldValue::Delay(_) => Field::Delay,
            FieldValue::WriteSize(_) => Field::WriteSize,
            FieldValue::KeepMissed(_) => Field::KeepMissed,
            FieldValue::OutputPath(_) => Field::OutputPath,
        }
    }

    /// The value a well-behaved device echoes after accepting this field.
    ///
    /// Numeric fields echo themselves, keep-missed echoes 0 or 1 and the
    /// output path echoes the number of path bytes accepted.
    ///
    /// `None` if the value cannot be expressed as an echo at all; such a
    /// value never passes [`FieldValue::validate`].
    pub fn expected_echo(&self) -> Option<i64> {
        match self {
            FieldValue::Irq(irq) => Some(i64::from(*irq)),
            FieldValue::Delay(ms) => Some(i64::from(*ms)),
            FieldValue::WriteSize(size) => i64::try_from(*size).ok(),
            FieldValue::KeepMissed(keep) => Some(i64::from(*keep)),
            FieldValue::OutputPath(path) => i64::try_from(path.as_os_str().len()).ok(),
        }
    }

    /// Checks the value's domain before anything is sent to the device
    pub fn validate(&self) -> Result<()> {
        let field = self.field();
        let invalid = |reason: &str| GihError::InvalidArgument {
            field,
            reason: reason.to_string(),
        };

        match self {
            FieldValue::Irq(0) => Err(invalid("must be a positive integer")),
            FieldValue::Irq(irq) if *irq > MAX_IRQ => {
                Err(invalid(format!("must not exceed {}", MAX_IRQ).as_str()))
            }
            FieldValue::WriteSize(0) => Err(invalid("must be a positive number of bytes")),
            FieldValue::WriteSize(size) if u64::try_from(*size).map_or(true, |s| s > MAX_WRITE_SIZE) => {
                Err(invalid(format!("must not exceed {} bytes", MAX_WRITE_SIZE).as_str()))
            }
            FieldValue::OutputPath(path) => validate_output_path(path).map_err(|r| invalid(r.as_str())),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Irq(irq) => write!(f, "{}", irq),
            FieldValue::Delay(ms) => write!(f, "{} ms", ms),
            FieldValue::WriteSize(size) => write!(f, "{} bytes", size),
            FieldValue::KeepMissed(keep) => write!(f, "{}", keep),
            FieldValue::OutputPath(path) => write!(f, "{}", path.display()),
        }
    }
}

fn validate_output_path(path: &Path) -> core::result::Result<(), String> {
    if path.as_os_str().is_empty() {
        return Err("path is empty".to_string());
    }
    if path.as_os_str().len() > MAX_OUTPUT_PATH_LEN {
        return Err(format!(
            "{} is longer than {} bytes",
            path.display(),
            MAX_OUTPUT_PATH_LEN
        ));
    }
    match path.metadata() {
        Ok(meta) if meta.is_dir() => Err(format!("{} is a directory", path.display())),
        Ok(_) => Ok(()),
        Err(_) => Err(format!("{} does not exist", path.display())),
    }
}

/// Field values verified against the device.
///
/// A field is `Some` only after the device echoed exactly the requested value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub irq: Option<u32>,
    pub delay_ms: Option<u32>,
    pub write_size: Option<usize>,
    pub keep_missed: Option<bool>,
    pub output_path: Option<PathBuf>,
}

impl Configuration {
    /// Fields that still have no value
    pub fn unset(&self) -> ConfigFields {
        let mut unset = ConfigFields::empty();
        unset.set(ConfigFields::IRQ, self.irq.is_none());
        unset.set(ConfigFields::DELAY, self.delay_ms.is_none());
        unset.set(ConfigFields::WRITE_SIZE, self.write_size.is_none());
        unset.set(ConfigFields::KEEP_MISSED, self.keep_missed.is_none());
        unset.set(ConfigFields::OUTPUT_PATH, self.output_path.is_none());
        unset
    }

    pub fn is_complete(&self) -> bool {
        self.unset().is_empty()
    }

    /// Set fields as values, in application order
    pub fn values(&self) -> Vec<FieldValue> {
        let mut values = Vec::with_capacity(Field::ALL.len());
        if let Some(irq) = self.irq {
            values.push(FieldValue::Irq(irq));
        }
        if let Some(ms) = self.delay_ms {
            values.push(FieldValue::Delay(ms));
        }
        if let Some(size) = self.write_size {
            values.push(FieldValue::WriteSize(size));
        }
        if let Some(keep) = self.keep_missed {
            values.push(FieldValue::KeepMissed(keep));
        }
        if let Some(path) = &self.output_path {
            values.push(FieldValue::OutputPath(path.clone()));
        }
        values
    }

    pub(crate) fn set(&mut self, value: FieldValue) {
        match value {
            FieldValue::Irq(irq) => self.irq = Some(irq),
            FieldValue::Delay(ms) => self.delay_ms = Some(ms),
            FieldValue::WriteSize(size) => self.write_size = Some(size),
            FieldValue::KeepMissed(keep) => self.keep_missed = Some(keep),
            FieldValue::OutputPath(path) => self.output_path = Some(path),
        }
    }

    pub(crate) fn clear(&mut self, field: Field) {
        match field {
            Field::Irq => self.irq = None,
            Field::Delay => self.delay_ms = None,
            Field::WriteSize => self.write_size = None,
            Field::KeepMissed => self.keep_missed = None,
            Field::OutputPath => self.output_path = None,
        }
    }
}

/// Lifecycle of an open gih device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Open, no field accepted yet
    Unconfigured,
    /// At least one field accepted; fields may still change
    Configuring,
    /// Capturing interrupts; accepts writes
    Armed,
    /// The stop command failed while armed; only `close` is accepted.
    ///
    /// Reconfiguring is refused as well, because the driver may still be
    /// capturing with the old fields. Closing and reopening starts over.
    Stopped,
}

impl RunState {
    /// Whether configuration fields may be changed in this state
    pub fn permits_mutation(self) -> bool {
        matches!(self, RunState::Unconfigured | RunState::Configuring)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Unconfigured => "unconfigured",
            RunState::Configuring => "configuring",
            RunState::Armed => "armed",
            RunState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The configuration capability: translates a field into the device
/// specific control operation.
///
/// Return conventions follow the native surface: `apply` returns the value
/// the device reports as accepted (see [`FieldValue::expected_echo`]),
/// `start` and `stop` return 0 on success. Any `Err` or unexpected value is
/// a rejection.
pub trait ConfigBackend {
    fn apply(&mut self, fd: BorrowedFd<'_>, value: &FieldValue) -> io::Result<i64>;

    fn start(&mut self, fd: BorrowedFd<'_>) -> io::Result<i32>;

    fn stop(&mut self, fd: BorrowedFd<'_>) -> io::Result<i32>;
}

impl<B: ConfigBackend + ?Sized> ConfigBackend for Box<B> {
    fn apply(&mut self, fd: BorrowedFd<'_>, value: &FieldValue) -> io::Result<i64> {
        (**self).apply(fd, value)
    }

    fn start(&mut self, fd: BorrowedFd<'_>) -> io::Result<i32> {
        (**self).start(fd)
    }

    fn stop(&mut self, fd: BorrowedFd<'_>) -> io::Result<i32> {
        (**self).stop(fd)
    }
}
