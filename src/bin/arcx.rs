//! arcx - ARC client tool.
//!
//! Authenticates to an arcxd server, runs one remote command with
//! local stdin/stdout attached, and exits with the remote command's
//! exit status.
//!
//! ## Usage
//!
//! ```sh
//! arcx [-h host] [-p port] [-u user] [-w secretfile] [-m mech,mech]
//!      [-V 2.0|2.1] [-L] [-d] command [args...]
//! ```
//!
//! The secret comes from `-w <file>` or the `ARCX_SECRET` environment
//! variable. `-L` asks for active (client-listens) data channels.
//! Connection, authentication, and protocol failures exit with 111 so
//! they stay distinguishable from any remote exit status.

use std::process::ExitCode;

use arcx::client::{ClientOptions, ClientSession};
use arcx::constants::DEFAULT_PORT;
use arcx::log::LogMask;
use arcx::protocol::ProtocolVersion;

/// Exit status for local (non-command) failures.
const EXIT_UNAVAILABLE: u8 = 111;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
struct Invocation {
    host: String,
    port: u16,
    options: ClientOptions,
    command: String,
    args: Vec<String>,
}

fn parse_args() -> Result<Option<Invocation>, String> {
    let argv: Vec<String> = std::env::args().collect();
    let mut host = "127.0.0.1".to_string();
    let mut port = DEFAULT_PORT;
    let mut user = std::env::var("USER").unwrap_or_default();
    let mut secret_file: Option<String> = None;
    let mut mechanisms: Option<Vec<String>> = None;
    let mut version = ProtocolVersion::LATEST;
    let mut active_data = false;
    let mut debug = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-h" => {
                host = take_value(&argv, i, "-h requires a host")?;
                i += 2;
            }
            "-p" => {
                let value = take_value(&argv, i, "-p requires a port")?;
                port = value.parse().map_err(|_| format!("bad port '{value}'"))?;
                i += 2;
            }
            "-u" => {
                user = take_value(&argv, i, "-u requires a user")?;
                i += 2;
            }
            "-w" => {
                secret_file = Some(take_value(&argv, i, "-w requires a file")?);
                i += 2;
            }
            "-m" => {
                let value = take_value(&argv, i, "-m requires a mechanism list")?;
                mechanisms = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
                i += 2;
            }
            "-V" => {
                let value = take_value(&argv, i, "-V requires a version")?;
                version = match value.as_str() {
                    "2.0" => ProtocolVersion::V2_0,
                    "2.1" => ProtocolVersion::V2_1,
                    other => return Err(format!("unknown version '{other}'")),
                };
                i += 2;
            }
            "-L" => {
                active_data = true;
                i += 1;
            }
            "-d" => {
                debug = true;
                i += 1;
            }
            "--help" => return Ok(None),
            other if other.starts_with('-') => {
                return Err(format!("unknown option '{other}'"));
            }
            _ => break,
        }
    }

    let Some(command) = argv.get(i).cloned() else {
        return Err("no command given".to_string());
    };
    let args = argv[i + 1..].to_vec();

    if user.is_empty() {
        return Err("no user: pass -u or set $USER".to_string());
    }
    let secret = match secret_file {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read secret file {path}: {e}"))?
            .trim_end_matches(['\r', '\n'])
            .to_string(),
        None => std::env::var("ARCX_SECRET")
            .map_err(|_| "no secret: pass -w <file> or set $ARCX_SECRET".to_string())?,
    };

    let mut options = ClientOptions::new(&user, &secret);
    if let Some(mechanisms) = mechanisms {
        options.mechanisms = mechanisms;
    }
    options.version = version;
    options.active_data = active_data;
    if debug {
        options.mask = LogMask(63);
    }

    Ok(Some(Invocation {
        host,
        port,
        options,
        command,
        args,
    }))
}

fn take_value(argv: &[String], i: usize, err: &str) -> Result<String, String> {
    argv.get(i + 1).cloned().ok_or_else(|| err.to_string())
}

fn print_usage() {
    eprintln!("Usage: arcx [options] command [args...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h <host>    server host (default: 127.0.0.1)");
    eprintln!("  -p <port>    server port (default: {DEFAULT_PORT})");
    eprintln!("  -u <user>    identity (default: $USER)");
    eprintln!("  -w <file>    read the secret from this file");
    eprintln!("  -m <mechs>   SASL mechanisms to offer, comma separated");
    eprintln!("  -V <ver>     protocol version: 2.0 or 2.1 (default: 2.1)");
    eprintln!("  -L           active data channel (client listens)");
    eprintln!("  -d           wire-level debug logging");
    eprintln!();
    eprintln!("The secret comes from -w or $ARCX_SECRET.");
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let invocation = match parse_args() {
        Ok(Some(invocation)) => invocation,
        Ok(None) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("arcx: {err}");
            print_usage();
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };
    if invocation.options.mask.enabled(arcx::log::facility::DEBUG) {
        arcx::log::init_stderr();
    }

    let addr = match tokio::net::lookup_host((invocation.host.as_str(), invocation.port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
    {
        Some(addr) => addr,
        None => {
            eprintln!("arcx: cannot resolve {}", invocation.host);
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };

    let mut session = match ClientSession::connect(addr, invocation.options).await {
        Ok(session) => session,
        Err(err) => {
            eprintln!("arcx: {err}");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };

    let status = session
        .run(
            &invocation.command,
            &invocation.args,
            tokio::io::stdin(),
            tokio::io::stdout(),
        )
        .await;

    match status {
        Ok(status) => {
            let _ = session.quit().await;
            // The remote status maps through; negative or oversized
            // values collapse to the conventional failure byte.
            ExitCode::from(u8::try_from(status).unwrap_or(1))
        }
        Err(err) => {
            let detail = session.last_error().unwrap_or_default().to_string();
            if detail.is_empty() {
                eprintln!("arcx: {err}");
            } else {
                eprintln!("arcx: {err} ({detail})");
            }
            let _ = session.quit().await;
            ExitCode::from(EXIT_UNAVAILABLE)
        }
    }
}
