//! gihctl - CLI tool for the gih interrupt handler module
//!
//! Commands:
//! - `gihctl load [--module PATH]` - Insert the kernel module
//! - `gihctl unload` - Remove the kernel module
//! - `gihctl reload [--module PATH]` - Remove and insert the module again
//! - `gihctl logs [--order channel|time|count] [--channel 0|1|2]` - Dump the event logs
//! - `gihctl status` - Show module and node status
//! - `gihctl settings` - Print the effective settings as TOML
//!
//! Configuring and arming the device needs the ioctl backend and is left to
//! applications linking `gih-control`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use gih_control::{Channel, Driver, LogChannels, Settings, ShellBinding, SortKey};

const PROC_MODULES: &str = "/proc/modules";

#[derive(Parser)]
#[command(name = "gihctl")]
#[command(author = "Weiyang Wang")]
#[command(version)]
#[command(about = "gih - generic interrupt handler control", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert the kernel module
    Load {
        /// Module object, defaults to `module_path` from the settings
        #[arg(short, long)]
        module: Option<PathBuf>,
    },

    /// Remove the kernel module
    Unload,

    /// Remove and insert the kernel module again
    Reload {
        /// Module object, defaults to `module_path` from the settings
        #[arg(short, long)]
        module: Option<PathBuf>,
    },

    /// Print the event logs
    Logs {
        /// Ordering: channel (alias type), time or count
        #[arg(short, long, default_value = "channel")]
        order: String,

        /// Only print one channel (0 interrupt, 1 workqueue entry, 2 workqueue exit),
        /// still ordered by `--order`
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        channel: Option<u8>,
    },

    /// Show module and node status
    Status,

    /// Print the effective settings
    Settings,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Load { module } => {
            let module = module.unwrap_or_else(|| settings.module_path.clone());
            load_module(&settings, &module)?;
        }

        Commands::Unload => {
            unload_module(&settings)?;
        }

        Commands::Reload { module } => {
            let module = module.unwrap_or_else(|| settings.module_path.clone());
            unload_module(&settings)?;
            load_module(&settings, &module)?;
        }

        Commands::Logs { order, channel } => {
            let order: SortKey = order.parse()?;
            let channel = channel.and_then(|minor| Channel::from_minor(usize::from(minor)));
            dump_logs(&settings, order, channel)?;
        }

        Commands::Status => {
            show_status(&settings);
        }

        Commands::Settings => {
            print!("{}", settings.to_toml_string()?);
        }
    }

    Ok(())
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(Settings::default()),
    }
}

fn driver(settings: &Settings) -> anyhow::Result<Driver<ShellBinding>> {
    let mut driver = Driver::with_name(ShellBinding, settings.module_name.as_str());
    driver
        .detect(PROC_MODULES)
        .with_context(|| format!("Failed to read {}", PROC_MODULES))?;
    Ok(driver)
}

fn load_module(settings: &Settings, module: &Path) -> anyhow::Result<()> {
    println!("{} Loading {}...", "📦".green(), module.display().to_string().bold());

    let mut driver = driver(settings)?;
    if driver.is_loaded() {
        anyhow::bail!("Module '{}' is already loaded", driver.name());
    }
    driver.load(module)?;

    println!("{} Module '{}' loaded", "✅".green(), driver.name());
    Ok(())
}

fn unload_module(settings: &Settings) -> anyhow::Result<()> {
    let mut driver = driver(settings)?;
    if !driver.is_loaded() {
        println!("{} Module '{}' is not loaded", "⚠".yellow(), driver.name());
        return Ok(());
    }

    println!("{} Unloading {}...", "🧹".green(), driver.name().bold());
    driver.unload()?;

    println!("{} Module '{}' unloaded", "✅".green(), driver.name());
    Ok(())
}

fn dump_logs(settings: &Settings, order: SortKey, channel: Option<Channel>) -> anyhow::Result<()> {
    let logs = LogChannels::from_settings(settings);

    let records = match channel {
        Some(channel) => logs
            .read_sorted(channel, order)
            .with_context(|| format!("Failed to read {}", logs.path(channel).display()))?,
        None => logs.read_all(order)?,
    };

    log::debug!("{} records, order {}", records.len(), order);
    for record in &records {
        println!("{}", record);
    }
    Ok(())
}

fn show_status(settings: &Settings) {
    println!("{}", "gih - generic interrupt handler".bold().green());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));

    match driver(settings) {
        Ok(driver) if driver.is_loaded() => {
            println!("\nModule '{}': {}", driver.name(), "loaded".green())
        }
        Ok(driver) => println!("\nModule '{}': {}", driver.name(), "not loaded".yellow()),
        Err(e) => println!("\nModule '{}': {} ({:#})", settings.module_name, "unknown".red(), e),
    }

    println!("\nNodes:");
    print_node("control", &settings.control_node);
    for channel in Channel::ALL {
        print_node(&format!("log {}", channel.minor()), &settings.log_nodes[channel.minor()]);
    }
}

fn print_node(label: &str, path: &Path) {
    let state = if path.exists() {
        "present".green()
    } else {
        "missing".red()
    };
    println!("  {:<10} {:<20} {}", label, path.display(), state);
}
