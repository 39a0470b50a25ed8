//! Configuration protocol and run state machine
//!
//! A [`Controller`] owns the control node and walks the device through
//! `open -> configure* -> start/stop* -> close`. Every field goes through the
//! configuration capability and is recorded only when the device echoes
//! back exactly what was requested.
//!
//! # State machine
//! ```text
//!  open          configure*          start           stop
//! -----> Unconfigured ----> Configuring -----> Armed -----> Configuring
//!                                                |
//!                                                | stop command fails
//!                                                v
//!                                             Stopped (close only)
//! ```
//! `close` from any state releases the descriptor, halts capture and drops
//! the verified configuration.
//!
//! A controller is not shared between threads by itself; wrap it in a single
//! `Mutex` so that arming and configuration observe the field set atomically.

use core::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::config::{ConfigBackend, Configuration, FieldValue, RunState};
use crate::device::{DeviceHandle, OpenOutcome, WriteMode};
use crate::driver::{Driver, DriverBinding};
use crate::settings::Settings;
use crate::{GihError, Result};

/// Userland controller for one gih device
pub struct Controller<B: ConfigBackend> {
    device: DeviceHandle,
    backend: B,
    config: Configuration,
    state: RunState,
}

impl<B: ConfigBackend> Controller<B> {
    /// Create a controller for the control node at `control_node`.
    ///
    /// The node is not opened until [`Controller::open`].
    pub fn new(control_node: impl Into<PathBuf>, backend: B) -> Self {
        Self::with_device(DeviceHandle::new(control_node), backend)
    }

    pub fn from_settings(settings: &Settings, backend: B) -> Self {
        let device = DeviceHandle::with_policy(&settings.control_node, settings.write_policy());
        Self::with_device(device, backend)
    }

    pub fn with_device(device: DeviceHandle, backend: B) -> Self {
        Self {
            device,
            backend,
            config: Configuration::default(),
            state: RunState::Unconfigured,
        }
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Fields verified against the device so far
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.device.is_open()
    }

    pub fn is_armed(&self) -> bool {
        self.device.is_open() && self.state == RunState::Armed
    }

    /// Open the control node. Opening twice succeeds and keeps the first
    /// descriptor.
    pub fn open(&mut self) -> Result<OpenOutcome> {
        let outcome = self.device.open()?;
        if outcome == OpenOutcome::Opened {
            self.reset();
        }
        Ok(outcome)
    }

    /// Close the control node. The driver stops capturing interrupts when
    /// the node is released, so an armed device is halted here as well.
    /// Closing twice succeeds.
    pub fn close(&mut self) -> Result<()> {
        if self.state == RunState::Armed && self.device.is_open() {
            info!("closing armed device, interrupt capture halts");
        }
        self.device.close()?;
        self.reset();
        Ok(())
    }

    /// Close the device, then unload the module it belongs to
    pub fn shutdown<D: DriverBinding>(&mut self, driver: &mut Driver<D>) -> Result<()> {
        self.close()?;
        driver.unload()
    }

    fn reset(&mut self) {
        self.state = RunState::Unconfigured;
        self.config = Configuration::default();
    }

    fn ensure_mutable(&self) -> Result<()> {
        if !self.device.is_open() {
            return Err(GihError::NotOpen);
        }
        match self.state {
            RunState::Armed => Err(GihError::AlreadyRunning),
            RunState::Stopped => Err(GihError::DeviceStopped),
            RunState::Unconfigured | RunState::Configuring => Ok(()),
        }
    }

    /// Send one field to the device.
    ///
    /// The field is recorded only if the device echoes the expected value;
    /// on any rejection it is left unset.
    ///
    /// # Errors
    /// `NotOpen`, `AlreadyRunning`, `DeviceStopped`, `InvalidArgument` for an
    /// out-of-domain value, `ConfigurationRejected` when the device refuses
    /// or echoes something else.
    pub fn apply(&mut self, value: FieldValue) -> Result<()> {
        self.ensure_mutable()?;
        value.validate()?;

        let field = value.field();
        let expected = value.expected_echo();
        let fd = self.device.fd()?;

        let reported = match self.backend.apply(fd, &value) {
            Ok(echo) if Some(echo) == expected => {
                debug!("{} configured to {}", field, value);
                self.config.set(value);
                self.state = RunState::Configuring;
                return Ok(());
            }
            Ok(echo) => echo.to_string(),
            Err(e) => e.to_string(),
        };

        warn!("{} rejected: requested {}, device reported {}", field, value, reported);
        self.config.clear(field);
        Err(GihError::ConfigurationRejected {
            field,
            requested: value.to_string(),
            reported,
        })
    }

    pub fn configure_irq(&mut self, irq: u32) -> Result<()> {
        self.apply(FieldValue::Irq(irq))
    }

    /// Delay between the interrupt and the deferred write, in milliseconds
    pub fn configure_delay(&mut self, delay_ms: u32) -> Result<()> {
        self.apply(FieldValue::Delay(delay_ms))
    }

    pub fn configure_write_size(&mut self, bytes: usize) -> Result<()> {
        self.apply(FieldValue::WriteSize(bytes))
    }

    /// Whether data still waiting in the driver buffer is kept (appended to)
    /// or dropped when new data is written
    pub fn configure_keep_missed(&mut self, keep: bool) -> Result<()> {
        self.apply(FieldValue::KeepMissed(keep))
    }

    pub fn configure_output_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.apply(FieldValue::OutputPath(path.as_ref().to_path_buf()))
    }

    /// Apply every set field of `config`, stopping at the first failure
    pub fn configure(&mut self, config: &Configuration) -> Result<()> {
        for value in config.values() {
            self.apply(value)?;
        }
        Ok(())
    }

    /// Arm the device.
    ///
    /// # Errors
    /// `NotOpen`, `AlreadyRunning`, `DeviceStopped`,
    /// `IncompleteConfiguration` naming every unset field, or
    /// `CommandFailed` if the device refuses to start. Nothing changes on
    /// failure.
    pub fn start(&mut self) -> Result<()> {
        if !self.device.is_open() {
            return Err(GihError::NotOpen);
        }
        match self.state {
            RunState::Armed => return Err(GihError::AlreadyRunning),
            RunState::Stopped => return Err(GihError::DeviceStopped),
            RunState::Unconfigured | RunState::Configuring => {}
        }

        let unset = self.config.unset();
        if !unset.is_empty() {
            return Err(GihError::IncompleteConfiguration { unset });
        }

        let fd = self.device.fd()?;
        match self.backend.start(fd) {
            Ok(0) => {
                info!("gih device armed on IRQ {:?}", self.config.irq);
                self.state = RunState::Armed;
                Ok(())
            }
            Ok(status) => Err(GihError::CommandFailed {
                command: "start",
                reason: format!("device returned {}", status),
            }),
            Err(e) => Err(GihError::CommandFailed {
                command: "start",
                reason: e.to_string(),
            }),
        }
    }

    /// Disarm the device, keeping every field for the next `start`.
    ///
    /// If the device refuses to stop, the controller moves to
    /// [`RunState::Stopped`] and only accepts `close`.
    pub fn stop(&mut self) -> Result<()> {
        if !self.device.is_open() {
            return Err(GihError::NotOpen);
        }
        if self.state != RunState::Armed {
            return Err(GihError::NotRunning);
        }

        let fd = self.device.fd()?;
        let reason = match self.backend.stop(fd) {
            Ok(0) => {
                info!("gih device stopped");
                self.state = RunState::Configuring;
                return Ok(());
            }
            Ok(status) => format!("device returned {}", status),
            Err(e) => e.to_string(),
        };

        warn!("stop command failed ({}), close the device to recover", reason);
        self.state = RunState::Stopped;
        Err(GihError::CommandFailed {
            command: "stop",
            reason,
        })
    }

    /// Queue payload data; the driver sends it out on the next interrupts.
    ///
    /// # Errors
    /// `NotOpen`, `NotRunning` unless armed, `WouldBlock` for a full driver
    /// buffer in non-blocking mode, `TimedOut` in blocking mode,
    /// `PermissionDenied`.
    pub fn write(&mut self, bytes: &[u8], mode: WriteMode) -> Result<usize> {
        if !self.device.is_open() {
            return Err(GihError::NotOpen);
        }
        if self.state != RunState::Armed {
            return Err(GihError::NotRunning);
        }
        self.device.write_raw(bytes, mode)
    }
}

impl<B: ConfigBackend> fmt::Display for Controller<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show<T: fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "unset".to_string(), |v| v.to_string())
        }

        writeln!(f, "========gih device========")?;
        writeln!(
            f,
            "- Device {} is {}",
            self.device.path().display(),
            if self.device.is_open() { "opened" } else { "closed" }
        )?;
        writeln!(f, "- Run state: {}", self.state)?;
        writeln!(f, "- Configuration:")?;
        writeln!(f, "     IRQ: {}", show(self.config.irq))?;
        writeln!(f, "     Delay Time: {} millisecond(s)", show(self.config.delay_ms))?;
        writeln!(f, "     Write Size: {} byte(s) on interrupt", show(self.config.write_size))?;
        writeln!(f, "     Keep Missed Data: {}", show(self.config.keep_missed))?;
        writeln!(
            f,
            "     Destination File Path: {}",
            show(self.config.output_path.as_ref().map(|p| p.display()))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFields, Field, MAX_IRQ};
    use std::io;
    use std::os::fd::BorrowedFd;
    use crate::mock::{MockBackend, MockCall};

    struct Fixture {
        dir: tempfile::TempDir,
        node: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("gih");
        let output = dir.path().join("out");
        std::fs::write(&node, b"").unwrap();
        std::fs::write(&output, b"").unwrap();
        Fixture {
            dir,
            node,
            output,
        }
    }

    fn configured(fx: &Fixture) -> Controller<MockBackend> {
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();
        ctl.configure_irq(4).unwrap();
        ctl.configure_delay(10).unwrap();
        ctl.configure_write_size(32).unwrap();
        ctl.configure_keep_missed(true).unwrap();
        ctl.configure_output_path(&fx.output).unwrap();
        ctl
    }

    #[test]
    fn test_configure_requires_open() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        assert!(matches!(ctl.configure_irq(4), Err(GihError::NotOpen)));
        assert!(ctl.backend().calls().is_empty());
    }

    #[test]
    fn test_configure_round_trip() {
        let fx = fixture();
        let ctl = configured(&fx);

        let config = ctl.configuration();
        assert_eq!(config.irq, Some(4));
        assert_eq!(config.delay_ms, Some(10));
        assert_eq!(config.write_size, Some(32));
        assert_eq!(config.keep_missed, Some(true));
        assert_eq!(config.output_path.as_deref(), Some(fx.output.as_path()));
        assert_eq!(ctl.state(), RunState::Configuring);
    }

    #[test]
    fn test_echo_mismatch_reverts_field() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();

        ctl.configure_irq(4).unwrap();
        ctl.backend_mut().set_echo(Field::Irq, 5);
        let err = ctl.configure_irq(6).unwrap_err();
        assert!(matches!(err, GihError::ConfigurationRejected { field: Field::Irq, .. }));
        assert_eq!(ctl.configuration().irq, None);
    }

    #[test]
    fn test_backend_error_reverts_field() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();

        ctl.backend_mut().fail(Field::WriteSize);
        assert!(matches!(
            ctl.configure_write_size(64),
            Err(GihError::ConfigurationRejected { field: Field::WriteSize, .. })
        ));
        assert_eq!(ctl.configuration().write_size, None);
    }

    #[test]
    fn test_invalid_values_never_reach_device() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();

        assert!(matches!(ctl.configure_irq(0), Err(GihError::InvalidArgument { .. })));
        assert!(matches!(ctl.configure_write_size(0), Err(GihError::InvalidArgument { .. })));
        assert!(matches!(
            ctl.configure_output_path(fx.dir.path()),
            Err(GihError::InvalidArgument { .. })
        ));
        assert!(ctl.backend().calls().is_empty());
        assert_eq!(ctl.state(), RunState::Unconfigured);
    }

    /// Device that refuses everything with the native -1 sentinel
    struct RejectAll;

    impl ConfigBackend for RejectAll {
        fn apply(&mut self, _fd: BorrowedFd<'_>, _value: &FieldValue) -> io::Result<i64> {
            Ok(-1)
        }

        fn start(&mut self, _fd: BorrowedFd<'_>) -> io::Result<i32> {
            Ok(-1)
        }

        fn stop(&mut self, _fd: BorrowedFd<'_>) -> io::Result<i32> {
            Ok(-1)
        }
    }

    #[test]
    fn test_rejection_sentinel_never_verifies_a_field() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, RejectAll);
        ctl.open().unwrap();

        assert!(matches!(
            ctl.configure_write_size(usize::MAX),
            Err(GihError::InvalidArgument { field: Field::WriteSize, .. })
        ));
        assert!(matches!(
            ctl.configure_irq(MAX_IRQ + 1),
            Err(GihError::InvalidArgument { field: Field::Irq, .. })
        ));
        assert!(matches!(
            ctl.configure_write_size(16),
            Err(GihError::ConfigurationRejected { field: Field::WriteSize, .. })
        ));
        assert!(matches!(
            ctl.configure_keep_missed(false),
            Err(GihError::ConfigurationRejected { .. })
        ));
        assert_eq!(ctl.configuration().unset(), ConfigFields::all());
        assert_eq!(ctl.state(), RunState::Unconfigured);
    }

    #[test]
    fn test_start_lists_every_unset_field() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();
        ctl.configure_delay(0).unwrap();
        ctl.configure_keep_missed(false).unwrap();

        match ctl.start() {
            Err(GihError::IncompleteConfiguration { unset }) => {
                assert_eq!(
                    unset,
                    ConfigFields::IRQ | ConfigFields::WRITE_SIZE | ConfigFields::OUTPUT_PATH
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_ne!(ctl.state(), RunState::Armed);
        assert_eq!(ctl.backend().starts(), 0);
    }

    #[test]
    fn test_start_stop_start() {
        let fx = fixture();
        let mut ctl = configured(&fx);

        ctl.start().unwrap();
        assert_eq!(ctl.state(), RunState::Armed);
        assert!(matches!(ctl.start(), Err(GihError::AlreadyRunning)));
        assert!(matches!(ctl.configure_irq(9), Err(GihError::AlreadyRunning)));

        ctl.stop().unwrap();
        assert_eq!(ctl.state(), RunState::Configuring);
        assert!(matches!(ctl.stop(), Err(GihError::NotRunning)));

        let before = ctl.configuration().clone();
        ctl.start().unwrap();
        assert_eq!(ctl.configuration(), &before);
        assert_eq!(ctl.backend().starts(), 2);
    }

    #[test]
    fn test_start_rejected_by_device() {
        let fx = fixture();
        let mut ctl = configured(&fx);
        ctl.backend_mut().set_start_status(-22);

        assert!(matches!(
            ctl.start(),
            Err(GihError::CommandFailed { command: "start", .. })
        ));
        assert_eq!(ctl.state(), RunState::Configuring);
    }

    #[test]
    fn test_failed_stop_requires_close() {
        let fx = fixture();
        let mut ctl = configured(&fx);
        ctl.start().unwrap();
        ctl.backend_mut().set_stop_status(1);

        assert!(matches!(ctl.stop(), Err(GihError::CommandFailed { command: "stop", .. })));
        assert_eq!(ctl.state(), RunState::Stopped);
        assert!(matches!(ctl.start(), Err(GihError::DeviceStopped)));
        assert!(matches!(ctl.configure_irq(4), Err(GihError::DeviceStopped)));
        assert!(matches!(ctl.write(b"x", WriteMode::NonBlocking), Err(GihError::NotRunning)));

        ctl.close().unwrap();
        assert_eq!(ctl.state(), RunState::Unconfigured);
    }

    #[test]
    fn test_write_requires_armed() {
        let fx = fixture();
        let mut ctl = configured(&fx);
        assert!(matches!(ctl.write(b"data", WriteMode::Blocking), Err(GihError::NotRunning)));

        ctl.start().unwrap();
        assert_eq!(ctl.write(b"data", WriteMode::NonBlocking).unwrap(), 4);
        assert_eq!(ctl.write(b"more", WriteMode::Blocking).unwrap(), 4);
        assert_eq!(std::fs::read(&fx.node).unwrap(), b"datamore");
    }

    #[test]
    fn test_close_while_armed() {
        let fx = fixture();
        let mut ctl = configured(&fx);
        ctl.start().unwrap();

        ctl.close().unwrap();
        assert!(!ctl.is_armed());
        assert_eq!(ctl.state(), RunState::Unconfigured);
        assert!(matches!(ctl.write(b"late", WriteMode::NonBlocking), Err(GihError::NotOpen)));
        // the driver is halted by releasing the node, not by a stop command
        assert!(!ctl.backend().calls().contains(&MockCall::Stop));

        assert!(ctl.close().is_ok());
    }

    #[test]
    fn test_reopen_starts_unconfigured() {
        let fx = fixture();
        let mut ctl = configured(&fx);
        ctl.close().unwrap();

        assert_eq!(ctl.open().unwrap(), OpenOutcome::Opened);
        assert!(matches!(
            ctl.start(),
            Err(GihError::IncompleteConfiguration { unset }) if unset == ConfigFields::all()
        ));
    }

    #[test]
    fn test_configure_stops_at_first_failure() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();
        ctl.backend_mut().fail(Field::WriteSize);

        let wanted = Configuration {
            irq: Some(1),
            delay_ms: Some(2),
            write_size: Some(3),
            keep_missed: Some(false),
            output_path: Some(fx.output.clone()),
        };
        assert!(ctl.configure(&wanted).is_err());
        assert_eq!(
            ctl.configuration().unset(),
            ConfigFields::WRITE_SIZE | ConfigFields::KEEP_MISSED | ConfigFields::OUTPUT_PATH
        );
    }

    #[test]
    fn test_status_report() {
        let fx = fixture();
        let mut ctl = Controller::new(&fx.node, MockBackend::new());
        ctl.open().unwrap();
        ctl.configure_irq(11).unwrap();

        let report = ctl.to_string();
        assert!(report.contains("is opened"));
        assert!(report.contains("Run state: configuring"));
        assert!(report.contains("IRQ: 11"));
        assert!(report.contains("Keep Missed Data: unset"));
    }
}
