//! Server configuration: an INI file with typed, validated sections.
//!
//! ```ini
//! [main]
//! service = arcx
//! timeout = 30
//!
//! [logging]
//! level = 13
//! destination = stderr
//!
//! [arcd]
//! host = 0.0.0.0
//! port = 4242
//! pid_file = /run/arcxd.pid
//! max_requests = 100
//! min_servers = 2
//! max_servers = 8
//! min_spare_servers = 1
//! max_spare_servers = 4
//! sasl_mechanisms = SCRAM-SHA-256,PLAIN
//!
//! [commands]
//! echo = /bin/echo
//! df = /bin/df -h
//!
//! [acl]
//! echo = alice,bob
//! df = alice
//!
//! [users]
//! alice = pencil
//! ```
//!
//! Every key has a default; an empty file is a valid configuration
//! that serves no commands. Malformed values fail startup with an
//! error naming the section and key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::acl::Acl;
use crate::constants::{
    DEFAULT_HOST, DEFAULT_MAX_REQUESTS, DEFAULT_MAX_SERVERS, DEFAULT_MAX_SPARE,
    DEFAULT_MECHANISMS, DEFAULT_MIN_SERVERS, DEFAULT_MIN_SPARE, DEFAULT_PORT, DEFAULT_SERVICE,
    DEFAULT_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::log::LogMask;

// =============================================================================
// Types
// =============================================================================

/// Where log events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogDestination {
    /// Write to stderr (the default; use under an init system).
    #[default]
    Stderr,
    /// Write to the local syslog socket.
    Syslog,
}

/// One configured command: an executable plus fixed argv prefix.
///
/// Client-supplied arguments are appended as separate argv entries;
/// nothing ever passes through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Absolute path of the executable.
    pub program: String,
    /// Fixed leading arguments.
    pub args: Vec<String>,
}

impl CommandSpec {
    fn parse(section: &str, key: &str, value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| Error::Config {
            section: section.to_string(),
            key: key.to_string(),
            reason: "empty command template".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// The `[arcd]` section: listen addresses and pool discipline.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub pid_file: Option<PathBuf>,
    pub max_requests: usize,
    pub min_servers: usize,
    pub max_servers: usize,
    pub min_spare_servers: usize,
    pub max_spare_servers: usize,
    pub sasl_mechanisms: Vec<String>,
    /// UID applied to spawned commands; inherit when absent.
    pub uid: Option<u32>,
    /// GID applied to spawned commands; inherit when absent.
    pub gid: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ports: vec![DEFAULT_PORT],
            pid_file: None,
            max_requests: DEFAULT_MAX_REQUESTS,
            min_servers: DEFAULT_MIN_SERVERS,
            max_servers: DEFAULT_MAX_SERVERS,
            min_spare_servers: DEFAULT_MIN_SPARE,
            max_spare_servers: DEFAULT_MAX_SPARE,
            sasl_mechanisms: DEFAULT_MECHANISMS
                .split(',')
                .map(str::to_string)
                .collect(),
            uid: None,
            gid: None,
        }
    }
}

/// The full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SASL service name (also the syslog ident).
    pub service: String,
    /// Timeout applied to every blocking read/write.
    pub timeout: Duration,
    /// Facility bitmask for the log filter.
    pub log_level: LogMask,
    /// Log sink.
    pub log_destination: LogDestination,
    /// Daemon/pool parameters.
    pub daemon: DaemonConfig,
    /// Command table: name → executable + argv template.
    pub commands: HashMap<String, CommandSpec>,
    /// Per-command username allowlists.
    pub acl: Acl,
    /// Built-in secret store entries.
    pub users: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            log_level: LogMask::DEFAULT,
            log_destination: LogDestination::default(),
            daemon: DaemonConfig::default(),
            commands: HashMap::new(),
            acl: Acl::new(),
            users: HashMap::new(),
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigRead`] if the file cannot be read and
    /// [`Error::Config`] for malformed or inconsistent values.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path).map_err(|e| Error::ConfigRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Builds a configuration from parsed INI content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed or inconsistent values.
    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let mut config = Config::default();

        if let Some(main) = ini.section(Some("main")) {
            if let Some(service) = main.get("service") {
                config.service = service.trim().to_string();
            }
            if let Some(timeout) = main.get("timeout") {
                let secs: u64 = parse_value("main", "timeout", timeout)?;
                if secs == 0 {
                    return Err(bad_value("main", "timeout", timeout, "must be positive"));
                }
                config.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(logging) = ini.section(Some("logging")) {
            if let Some(level) = logging.get("level") {
                config.log_level = LogMask(parse_value("logging", "level", level)?);
            }
            if let Some(dest) = logging.get("destination") {
                config.log_destination = match dest.trim() {
                    "stderr" => LogDestination::Stderr,
                    "syslog" => LogDestination::Syslog,
                    other => {
                        return Err(bad_value(
                            "logging",
                            "destination",
                            other,
                            "expected 'stderr' or 'syslog'",
                        ));
                    }
                };
            }
        }

        if let Some(arcd) = ini.section(Some("arcd")) {
            let d = &mut config.daemon;
            if let Some(host) = arcd.get("host") {
                d.host = host.trim().to_string();
            }
            if let Some(ports) = arcd.get("port") {
                d.ports = parse_port_list("arcd", "port", ports)?;
            }
            if let Some(pid_file) = arcd.get("pid_file") {
                d.pid_file = Some(PathBuf::from(pid_file.trim()));
            }
            if let Some(v) = arcd.get("max_requests") {
                d.max_requests = parse_value("arcd", "max_requests", v)?;
            }
            if let Some(v) = arcd.get("min_servers") {
                d.min_servers = parse_value("arcd", "min_servers", v)?;
            }
            if let Some(v) = arcd.get("max_servers") {
                d.max_servers = parse_value("arcd", "max_servers", v)?;
            }
            if let Some(v) = arcd.get("min_spare_servers") {
                d.min_spare_servers = parse_value("arcd", "min_spare_servers", v)?;
            }
            if let Some(v) = arcd.get("max_spare_servers") {
                d.max_spare_servers = parse_value("arcd", "max_spare_servers", v)?;
            }
            if let Some(mechs) = arcd.get("sasl_mechanisms") {
                d.sasl_mechanisms = mechs
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();
                if d.sasl_mechanisms.is_empty() {
                    return Err(bad_value(
                        "arcd",
                        "sasl_mechanisms",
                        mechs,
                        "mechanism list is empty",
                    ));
                }
            }
            if let Some(v) = arcd.get("uid") {
                d.uid = Some(parse_value("arcd", "uid", v)?);
            }
            if let Some(v) = arcd.get("gid") {
                d.gid = Some(parse_value("arcd", "gid", v)?);
            }
        }

        if let Some(commands) = ini.section(Some("commands")) {
            for (name, template) in commands.iter() {
                config
                    .commands
                    .insert(name.to_string(), CommandSpec::parse("commands", name, template)?);
            }
        }

        if let Some(acl) = ini.section(Some("acl")) {
            config.acl = Acl::from_entries(acl.iter());
        }

        if let Some(users) = ini.section(Some("users")) {
            for (user, secret) in users.iter() {
                config.users.insert(user.to_string(), secret.to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Cross-field consistency checks on the pool discipline.
    fn validate(&self) -> Result<()> {
        let d = &self.daemon;
        if d.ports.is_empty() {
            return Err(bad_value("arcd", "port", "", "at least one port required"));
        }
        if d.min_servers == 0 {
            return Err(bad_value("arcd", "min_servers", "0", "must be positive"));
        }
        if d.max_servers < d.min_servers {
            return Err(bad_value(
                "arcd",
                "max_servers",
                &d.max_servers.to_string(),
                "must be >= min_servers",
            ));
        }
        if d.max_spare_servers < d.min_spare_servers {
            return Err(bad_value(
                "arcd",
                "max_spare_servers",
                &d.max_spare_servers.to_string(),
                "must be >= min_spare_servers",
            ));
        }
        if d.max_spare_servers > d.max_servers {
            return Err(bad_value(
                "arcd",
                "max_spare_servers",
                &d.max_spare_servers.to_string(),
                "must be <= max_servers",
            ));
        }
        if d.max_requests == 0 {
            return Err(bad_value("arcd", "max_requests", "0", "must be positive"));
        }
        for command in self.commands.keys() {
            if command.is_empty() || !command.chars().all(valid_command_char) {
                return Err(bad_value(
                    "commands",
                    command,
                    "",
                    "command names are [A-Za-z0-9_-]",
                ));
            }
        }
        Ok(())
    }
}

fn valid_command_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

// =============================================================================
// Parse Helpers
// =============================================================================

fn parse_value<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::Config {
        section: section.to_string(),
        key: key.to_string(),
        reason: format!("cannot parse '{value}'"),
    })
}

fn parse_port_list(section: &str, key: &str, value: &str) -> Result<Vec<u16>> {
    let ports: Vec<u16> = value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| parse_value(section, key, p))
        .collect::<Result<_>>()?;
    if ports.is_empty() {
        return Err(bad_value(section, key, value, "port list is empty"));
    }
    Ok(ports)
}

fn bad_value(section: &str, key: &str, value: &str, reason: &str) -> Error {
    Error::Config {
        section: section.to_string(),
        key: key.to_string(),
        reason: if value.is_empty() {
            reason.to_string()
        } else {
            format!("'{value}': {reason}")
        },
    }
}
