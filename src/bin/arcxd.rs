//! arcxd - ARC server daemon.
//!
//! Binds the configured listen ports, preforks a pool of worker
//! processes, and serves authenticated remote command execution.
//!
//! ## Usage
//!
//! ```sh
//! arcxd [-d <loglevel>] [-F <config>] [-p <port,port>] [-P <pidfile>] [-v]
//! ```
//!
//! The daemon runs in the foreground (init systems supervise it);
//! `-d` additionally forces the stderr log sink with the given
//! facility mask. Exit status is 0 after a clean shutdown and 1 for
//! configuration or bind failures.
//!
//! Note: this process must never construct an async runtime; workers
//! are forked from it, and fork() is only well-defined while the
//! process is single-threaded. All async work happens in the workers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use arcx::config::{Config, LogDestination};
use arcx::log::LogMask;
use arcx::pidfile::PidFile;
use arcx::pool::PreforkPool;

/// Default configuration path.
const DEFAULT_CONFIG: &str = "/etc/arcxd.ini";

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Default)]
struct Options {
    /// `-d`: stderr sink + facility mask override.
    debug_level: Option<u32>,
    /// `-F`: config file path.
    config_path: Option<PathBuf>,
    /// `-p`: listen port override.
    ports: Option<Vec<u16>>,
    /// `-P`: PID file override.
    pid_file: Option<PathBuf>,
    /// `-v`: verbose startup summary.
    verbose: bool,
    help: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-d requires a log level".to_string())?;
                let level = value
                    .parse()
                    .map_err(|_| format!("bad log level '{value}'"))?;
                options.debug_level = Some(level);
                i += 2;
            }
            "-F" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-F requires a config path".to_string())?;
                options.config_path = Some(PathBuf::from(value));
                i += 2;
            }
            "-p" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-p requires a port list".to_string())?;
                let ports = value
                    .split(',')
                    .map(|p| p.trim().parse::<u16>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| format!("bad port list '{value}'"))?;
                options.ports = Some(ports);
                i += 2;
            }
            "-P" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-P requires a pid file path".to_string())?;
                options.pid_file = Some(PathBuf::from(value));
                i += 2;
            }
            "-v" => {
                options.verbose = true;
                i += 1;
            }
            "-h" | "--help" => {
                options.help = true;
                i += 1;
            }
            other => return Err(format!("unknown option '{other}'")),
        }
    }
    Ok(options)
}

fn print_usage() {
    eprintln!("Usage: arcxd [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d <level>   log to stderr with the given facility mask");
    eprintln!("  -F <path>    configuration file (default: {DEFAULT_CONFIG})");
    eprintln!("  -p <ports>   comma-separated listen ports (overrides config)");
    eprintln!("  -P <path>    PID file (overrides config)");
    eprintln!("  -v           verbose startup summary");
    eprintln!("  -h           this help");
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("arcxd: {err}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    if options.help {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let mut config = match load_config(&options) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("arcxd: {err}");
            return ExitCode::FAILURE;
        }
    };

    // CLI overrides beat the file.
    if let Some(ports) = &options.ports {
        config.daemon.ports = ports.clone();
    }
    if let Some(pid_file) = &options.pid_file {
        config.daemon.pid_file = Some(pid_file.clone());
    }
    if let Some(level) = options.debug_level {
        config.log_level = LogMask(level);
        config.log_destination = LogDestination::Stderr;
    }

    match config.log_destination {
        LogDestination::Stderr => {
            arcx::log::init_stderr();
        }
        LogDestination::Syslog => {
            if let Err(err) = arcx::log::init_syslog(&config.service) {
                eprintln!("arcxd: cannot open syslog: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    if options.verbose {
        eprintln!(
            "arcxd {}: service={} ports={:?} commands={} mechanisms={:?}",
            env!("CARGO_PKG_VERSION"),
            config.service,
            config.daemon.ports,
            config.commands.len(),
            config.daemon.sasl_mechanisms,
        );
    }

    let config = Arc::new(config);
    let mut pool = match PreforkPool::bind(Arc::clone(&config)) {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(facility = "ERR", error = %err, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let _pidfile = match &config.daemon.pid_file {
        Some(path) => match PidFile::create(path) {
            Ok(pidfile) => Some(pidfile),
            Err(err) => {
                tracing::error!(facility = "ERR", error = %err, "startup failed");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    match pool.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(facility = "ERR", error = %err, "pool failed");
            ExitCode::FAILURE
        }
    }
}

/// Loads the config file. A missing default path is fine (defaults
/// apply); a missing explicit `-F` path is an error.
fn load_config(options: &Options) -> arcx::Result<Config> {
    match &options.config_path {
        Some(path) => Config::load(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}
