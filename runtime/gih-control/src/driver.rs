//! Kernel module lifecycle
//!
//! Loading and unloading the gih module is delegated to a [`DriverBinding`].
//! [`ShellBinding`] runs `insmod`/`rmmod`; tests substitute a fake binding so
//! nothing here needs root or a real module.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, error, info, warn};

use crate::config::ConfigBackend;
use crate::controller::Controller;
use crate::{GihError, Result};

/// Name the module registers under
pub const DEFAULT_MODULE_NAME: &str = "gih";

/// Load/unload capability for the kernel module.
///
/// Both operations are single attempts that report success as a boolean.
pub trait DriverBinding {
    fn load(&mut self, module: &Path) -> bool;

    fn unload(&mut self, name: &str) -> bool;
}

/// Binding that shells out to `insmod` and `rmmod`
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellBinding;

impl ShellBinding {
    fn run(program: &str, arg: &str) -> bool {
        info!("Running shell command: \"{} {}\" ...", program, arg);

        let status = Command::new(program)
            .arg(arg)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status();

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                error!("{} {} failed, shell returned {}", program, arg, status);
                false
            }
            Err(e) => {
                error!("could not run {}: {}", program, e);
                false
            }
        }
    }
}

impl DriverBinding for ShellBinding {
    fn load(&mut self, module: &Path) -> bool {
        Self::run("insmod", &module.to_string_lossy())
    }

    fn unload(&mut self, name: &str) -> bool {
        Self::run("rmmod", name)
    }
}

/// Tracks whether the module is loaded on top of a binding
#[derive(Debug)]
pub struct Driver<B: DriverBinding> {
    binding: B,
    name: String,
    loaded: bool,
    module: Option<PathBuf>,
}

impl<B: DriverBinding> Driver<B> {
    pub fn new(binding: B) -> Self {
        Self::with_name(binding, DEFAULT_MODULE_NAME)
    }

    pub fn with_name(binding: B, name: impl Into<String>) -> Self {
        Self {
            binding,
            name: name.into(),
            loaded: false,
            module: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Pick up a module loaded by another process from a `/proc/modules`
    /// style listing. Returns whether the module is loaded.
    pub fn detect(&mut self, modules_list: impl AsRef<Path>) -> Result<bool> {
        let path = modules_list.as_ref();
        let listing = fs::read_to_string(path).map_err(|e| GihError::from_io(e, path))?;

        let present = listing
            .lines()
            .any(|line| line.split_whitespace().next() == Some(self.name.as_str()));
        if present != self.loaded {
            debug!("module {} loaded: {}", self.name, present);
        }
        self.loaded = present;
        if !present {
            self.module = None;
        }
        Ok(present)
    }

    /// Path of the loaded module object, if this driver loaded it
    pub fn module(&self) -> Option<&Path> {
        self.module.as_deref()
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    /// Load the module at `module`. Loading twice is a no-op.
    pub fn load(&mut self, module: impl AsRef<Path>) -> Result<()> {
        let module = module.as_ref();
        if self.loaded {
            warn!("module {} already loaded", self.name);
            return Ok(());
        }

        if !self.binding.load(module) {
            return Err(GihError::DriverLoadFailed {
                module: module.to_path_buf(),
            });
        }

        info!("module {} loaded from {}", self.name, module.display());
        self.loaded = true;
        self.module = Some(module.to_path_buf());
        Ok(())
    }

    /// Unload the module. Unloading an unloaded module succeeds.
    pub fn unload(&mut self) -> Result<()> {
        if !self.loaded {
            warn!("module {} is not loaded", self.name);
            return Ok(());
        }

        if !self.binding.unload(&self.name) {
            return Err(GihError::DriverUnloadFailed {
                module: self.name.clone(),
            });
        }

        info!("module {} unloaded", self.name);
        self.loaded = false;
        self.module = None;
        Ok(())
    }

    /// Unload only if `controller` no longer holds the control node open
    pub fn unload_checked<C: ConfigBackend>(&mut self, controller: &Controller<C>) -> Result<()> {
        if controller.is_open() {
            return Err(GihError::DeviceStillOpen {
                path: controller.device().path().to_path_buf(),
            });
        }
        self.unload()
    }

    /// Unload and load the same module object again, resetting driver state.
    ///
    /// Only possible for a module this driver loaded itself; a module picked
    /// up by [`Driver::detect`] fails with `ModulePathUnknown`.
    pub fn reload(&mut self) -> Result<()> {
        if !self.loaded {
            return Err(GihError::DriverNotLoaded {
                module: self.name.clone(),
            });
        }
        let module = self.module.clone().ok_or_else(|| GihError::ModulePathUnknown {
            module: self.name.clone(),
        })?;
        self.unload()?;
        self.load(module)
    }
}
