//! schedwatch daemon entry point.
//!
//! Wires process setup, signal handling and steal-source selection
//! around the probe loop.

mod daemon;
mod logging;
mod signals;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use schedwatch_common::config::{CgroupMode, StealSourceKind, StealSourceSelection, WatchConfig};
use schedwatch_common::error::{WatchError, EXIT_FAILURE};
use schedwatch_probe::clock::MonotonicClock;
use schedwatch_probe::probe::{PollWaiter, Probe};
use schedwatch_probe::realtime::apply_process_setup;
use schedwatch_probe::steal::select_steal_source;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::logging::{close_syslog, init_logging, LogSink};
use crate::signals::SignalController;

/// Environment variable naming a config file.
const CONFIG_ENV: &str = "SCHEDWATCH_CONFIG";

/// schedwatch command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "schedwatch",
    about = "Scheduling pause detector - reports when the process is not scheduled on time",
    version,
    long_about = None
)]
struct Args {
    /// Increase verbosity (repeat for trace output).
    #[arg(short = 'd', action = ArgAction::Count)]
    debug: u8,

    /// Run in the background and log to syslog.
    #[arg(short = 'D', overrides_with = "foreground")]
    daemonize: bool,

    /// Run in the foreground and log to stderr (default).
    #[arg(short = 'f', overrides_with = "daemonize")]
    foreground: bool,

    /// Do not set the RR scheduler.
    #[arg(short = 'p')]
    no_priority: bool,

    /// Steal time threshold in percent.
    #[arg(short = 'm', value_name = "STEAL_TH", value_parser = clap::value_parser!(u32).range(1..))]
    steal_threshold: Option<u32>,

    /// Move process to root cgroup (auto, on, off).
    #[arg(short = 'P', value_name = "MODE")]
    root_cgroup: Option<CgroupMode>,

    /// Maximum allowed scheduling gap in milliseconds.
    #[arg(short = 't', value_name = "TIMEOUT", value_parser = clap::value_parser!(u64).range(1..=3_600_000))]
    timeout: Option<u64>,

    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Steal time source (auto, kernel, guestlib).
    #[arg(long, value_name = "SOURCE")]
    steal_source: Option<StealSourceSelection>,
}

impl Args {
    fn log_sink(&self) -> LogSink {
        if self.daemonize && !self.foreground {
            LogSink::Syslog
        } else {
            LogSink::Stderr
        }
    }

    /// Apply command-line overrides on top of the loaded configuration.
    fn apply_to(&self, config: &mut WatchConfig) {
        if let Some(timeout) = self.timeout {
            config.max_gap = Duration::from_millis(timeout);
        }
        if let Some(threshold) = self.steal_threshold {
            config.steal_threshold = Some(f64::from(threshold));
        }
        if self.no_priority {
            config.realtime.set_priority = false;
        }
        if let Some(mode) = self.root_cgroup {
            config.realtime.root_cgroup = mode;
        }
        if let Some(selection) = self.steal_source {
            config.steal_source = selection;
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let sink = args.log_sink();

    init_logging(args.debug, sink);

    let code = match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = e
                .downcast_ref::<WatchError>()
                .map_or(EXIT_FAILURE, WatchError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    };

    if sink == LogSink::Syslog {
        close_syslog();
    }
    code
}

fn run(args: &Args) -> Result<()> {
    let mut config = load_config(args)?;
    args.apply_to(&mut config);

    // Reject a bad gap or threshold before detaching from the terminal
    config
        .resolve_thresholds(StealSourceKind::Kernel)
        .context("Invalid configuration")?;
    debug!(?config, "Configuration loaded");

    if args.log_sink() == LogSink::Syslog {
        daemon::detach_from_tty()?;
    }

    apply_process_setup(&config.realtime);

    let signals = SignalController::install().context("Failed to set up signal handlers")?;

    let source = select_steal_source(config.steal_source)?;
    let thresholds = config.resolve_thresholds(source.kind())?;

    let mut probe = Probe::new(MonotonicClock, source, PollWaiter, thresholds)?;
    probe.run(signals.flags())?;

    drop(probe);
    debug!("Steal time source closed");
    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Resolution priority:
/// 1. Command-line `--config` argument
/// 2. `SCHEDWATCH_CONFIG` environment variable
/// 3. Built-in defaults
fn load_config(args: &Args) -> Result<WatchConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return WatchConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from {CONFIG_ENV}");
            return WatchConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {CONFIG_ENV}={env_path}"));
        }
        warn!(path = %env_path, "{CONFIG_ENV} set but file does not exist, using defaults");
    }

    Ok(WatchConfig::default())
}
