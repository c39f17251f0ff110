//! flashy - BMC firmware update agent
//!
//! Runs one named update step against a flash device and reports the
//! outcome in the form a fleet update driver expects:
//!
//! - exit 0: success, nothing on stderr
//! - exit 42: failed, safe to reboot and retry
//! - exit 52: failed, unsafe to reboot
//! - exit 1: unknown error
//!
//! Failures also print `{"message": "..."}` on stderr.

mod cli;
mod progress;

use clap::Parser;
use cli::{Cli, Commands};
use flashy_core::tables::{
    is_data_partition_mounted, parse_mtd_table, read_mounts, read_mtd_table, writable_mtd_mounts,
};
use flashy_core::{Config, Result, StepArgs, StepOutcome, StepRegistry};
use flashy_flash::{
    default_steps, DeviceRegistry, MtdImageProgrammer, StepContext, SystemCommandRunner,
    VbootDetector,
};
use flashy_mtd::{DevWatchdog, FlashProgress, LinuxMtdHost, NoProgress, NoWatchdog, Watchdog};
use log::LevelFilter;
use progress::IndicatifProgress;
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn main() {
    let cli = Cli::parse();
    logger_builder(cli.verbose).init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => std::process::exit(report(&StepOutcome::UnknownError(e))),
    };

    let code = match cli.command {
        Commands::Run {
            step,
            device,
            image,
            no_progress,
            no_watchdog,
        } => {
            let steps = build_steps(config, no_progress, no_watchdog);
            let args = StepArgs {
                device_id: device,
                image_path: image,
            };
            log::info!("Running step '{}' on {}", step, args.device_id);
            report(&steps.run(&step, &args))
        }
        Commands::List => {
            list(&config);
            0
        }
        Commands::Status => match status(&config) {
            Ok(()) => 0,
            Err(e) => report(&StepOutcome::UnknownError(e)),
        },
    };
    std::process::exit(code);
}

/// Log level asked for with `-v` (debug) or `-vv` (trace)
fn verbosity_level(verbose: u8) -> Option<LevelFilter> {
    match verbose {
        0 => None, // default (info, or RUST_LOG)
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    }
}

fn logger_builder(verbose: u8) -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = verbosity_level(verbose) {
        builder.filter_level(level);
    }
    builder
}

/// Load the configuration file, or the built-in defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::from_toml_file(path);
    }

    let default_paths = [
        PathBuf::from("/etc/flashy.toml"),
        PathBuf::from("/usr/local/etc/flashy.toml"),
    ];
    for path in &default_paths {
        if path.is_file() {
            log::debug!("Loading configuration from {}", path.display());
            return Config::from_toml_file(path);
        }
    }
    Ok(Config::default())
}

fn build_steps(config: Config, no_progress: bool, no_watchdog: bool) -> StepRegistry {
    let watchdog: Box<dyn Watchdog> = if no_watchdog {
        Box::new(NoWatchdog)
    } else {
        Box::new(DevWatchdog::new(&config.watchdog, config.watchdog_timeout_secs))
    };
    let progress: Box<dyn FlashProgress> = if no_progress {
        Box::new(NoProgress)
    } else {
        Box::new(IndicatifProgress::new())
    };

    let ctx = StepContext::new(
        DeviceRegistry::with_defaults(config),
        Box::new(SystemCommandRunner),
        Box::new(MtdImageProgrammer::new(LinuxMtdHost, watchdog, progress)),
    );
    default_steps(Rc::new(ctx))
}

/// Print the JSON failure line and return the exit code
fn report(outcome: &StepOutcome) -> i32 {
    if let Some(json) = outcome.to_json() {
        log::error!("{}", outcome.state());
        eprintln!("{}", json);
    }
    outcome.exit_code()
}

fn list(config: &Config) {
    let steps = build_steps(config.clone(), true, true);
    println!("Steps:");
    for name in steps.names() {
        println!("  {}", name);
    }

    println!("\nFlash device types:");
    for info in DeviceRegistry::with_defaults(config.clone()).device_types() {
        println!("  {:<8} {}", info.name, info.description);
    }
}

fn status(config: &Config) -> Result<()> {
    let runner = SystemCommandRunner;
    let detector = VbootDetector::new(config, &runner);
    println!("Vboot system: {}", detector.is_vboot_system());
    println!("Vboot enforcement: {}", detector.get_vboot_enforcement()?);

    let table = read_mtd_table(&config.proc_mtd)?;
    println!("\nMTD partitions:");
    for entry in parse_mtd_table(&table)? {
        println!(
            "  {:<6} {:#010x} {:#010x} {}",
            entry.dev, entry.size, entry.erase_size, entry.name
        );
    }

    let mounts = read_mounts(&config.proc_mounts)?;
    println!("\nData partition mounted: {}", is_data_partition_mounted(&mounts));
    let writable = writable_mtd_mounts(&mounts);
    if !writable.is_empty() {
        println!("Writable MTD mounts:");
        for m in writable {
            println!("  {} on {} ({})", m.device, m.mount_point, m.fs_type);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_level() {
        assert_eq!(verbosity_level(0), None);
        assert_eq!(verbosity_level(1), Some(LevelFilter::Debug));
        assert_eq!(verbosity_level(2), Some(LevelFilter::Trace));
        assert_eq!(verbosity_level(5), Some(LevelFilter::Trace));
    }

    #[test]
    fn test_verbose_logger_lets_debug_through() {
        assert!(logger_builder(1).build().filter() >= LevelFilter::Debug);
        assert_eq!(logger_builder(2).build().filter(), LevelFilter::Trace);
    }
}
