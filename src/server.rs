//! Server role: responder handshake, authorization, command execution.
//!
//! One call to [`serve_connection`] handles one accepted control
//! socket from first byte to teardown:
//!
//! 1. SASL handshake (`AUTH` → `SASL`* → `OK`), gated by the
//!    expected-next set at every step.
//! 2. Command loop: `CMD` requests are looked up in the command table
//!    and checked against the ACL. Denials are recoverable: the
//!    session stays authenticated; everything else that goes wrong
//!    tears the connection down.
//! 3. Per command: spawn the configured executable (never a shell)
//!    with piped stdio, open the data channel, relay, report
//!    `EXIT <status>`.
//!
//! No command is dispatched before authentication completes: the
//! expected-next gate enforces it structurally, and the dispatcher
//! checks it again before spawning anything.

use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::TcpStream;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::arc_log;
use crate::config::{CommandSpec, Config};
use crate::constants::{
    CHILD_GRACE_PERIOD, MAX_COMMAND_ARG_LEN, MAX_COMMAND_NAME_LEN, MAX_SASL_TOKEN_LEN,
};
use crate::conn::Connection;
use crate::data;
use crate::error::{Error, Result};
use crate::log::facility;
use crate::protocol::{ProtocolVersion, Role, Verb, VerbSet};
use crate::sasl::{SaslSession, SecretStore, SessionStep, select_mechanism};

/// Serves one accepted control connection to completion.
///
/// # Errors
///
/// Returns the fatal error that ended the session, if any; a clean
/// `QUIT` or idle disconnect returns `Ok(())`.
pub async fn serve_connection(
    stream: TcpStream,
    config: Arc<Config>,
    store: Arc<dyn SecretStore>,
) -> Result<()> {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut conn = Connection::new(stream, Role::Server, config.timeout, config.log_level);
    arc_log!(conn.mask(), facility::USER, "connection from {peer}");

    let result = run_session(&mut conn, &config, store).await;
    if let Err(err) = &result {
        // Auth failures were already reported inside the handshake,
        // with more useful detail than the generic reason.
        if !matches!(err, Error::Auth(_)) {
            let reason = err.wire_reason();
            conn.send_err(&reason).await;
        }
    }
    conn.shutdown().await;

    match result {
        Ok(()) => {
            arc_log!(conn.mask(), facility::USER, "session with {peer} closed");
            Ok(())
        }
        Err(err) => Err(conn.fail(err)),
    }
}

async fn run_session(
    conn: &mut Connection,
    config: &Config,
    store: Arc<dyn SecretStore>,
) -> Result<()> {
    handshake(conn, config, store).await?;

    // A CMDPORT endpoint applies to the next command only.
    let mut active_endpoint: Option<std::net::SocketAddr> = None;

    loop {
        conn.clear_error();
        conn.expect(idle_set(conn.version()));

        let Some((verb, param)) = conn.recv_verb().await? else {
            // Clean disconnect while idle: not an error.
            return Ok(());
        };

        match verb {
            Verb::Quit => {
                conn.send_verb(Verb::Ok, Some("bye")).await?;
                return Ok(());
            }
            Verb::Cmdport => {
                let endpoint = data::parse_endpoint(param.as_deref().unwrap_or_default())?;
                active_endpoint = Some(endpoint);
                conn.send_verb(Verb::Ok, None).await?;
            }
            Verb::Cmd => {
                let param = param.unwrap_or_default();
                conn.set_command_param(Some(param.clone()));
                match dispatch_command(conn, config, &param, active_endpoint.take()).await {
                    Ok(()) => {}
                    Err(err) if err.is_recoverable() => {
                        conn.send_verb(Verb::Err, Some(&err.wire_reason())).await?;
                    }
                    Err(err) => return Err(err),
                }
            }
            other => {
                return Err(Error::Protocol(format!("unhandled verb {other}")));
            }
        }
    }
}

/// The verbs a peer may send while the session idles authenticated.
fn idle_set(version: ProtocolVersion) -> VerbSet {
    if version.admits(Verb::Cmdport) {
        VerbSet::of(&[Verb::Cmd, Verb::Cmdport, Verb::Quit])
    } else {
        VerbSet::of(&[Verb::Cmd, Verb::Quit])
    }
}

// =============================================================================
// Handshake
// =============================================================================

async fn handshake(
    conn: &mut Connection,
    config: &Config,
    store: Arc<dyn SecretStore>,
) -> Result<()> {
    conn.expect(VerbSet::of(&[Verb::Auth]));
    let Some((_, param)) = conn.recv_verb().await? else {
        return Err(Error::PeerClosed("before AUTH".to_string()));
    };

    let param = param.unwrap_or_default();
    let (version_token, offered) = param
        .split_once(' ')
        .ok_or_else(|| Error::Protocol("AUTH needs '<version> <mechanisms>'".to_string()))?;
    let client_version = ProtocolVersion::parse(version_token)
        .ok_or_else(|| Error::Protocol(format!("unknown version '{version_token}'")))?;
    let version = ProtocolVersion::negotiate(client_version, ProtocolVersion::LATEST);
    conn.set_version(version);

    let offer: Vec<&str> = offered.split(',').map(str::trim).collect();
    let Some(mech) = select_mechanism(&config.daemon.sasl_mechanisms, &offer) else {
        conn.send_err("no mutually supported mechanism").await;
        return Err(Error::Auth(format!("no mechanism overlap in '{offered}'")));
    };

    let mut sasl = SaslSession::server(mech, store)?;
    conn.send_verb(Verb::Ok, Some(&format!("{version} {mech}")))
        .await?;
    conn.expect(VerbSet::of(&[Verb::Sasl, Verb::Err]));

    loop {
        let Some((verb, param)) = conn.recv_verb().await? else {
            return Err(Error::PeerClosed("during SASL exchange".to_string()));
        };
        if verb == Verb::Err {
            return Err(Error::Auth(format!(
                "client aborted: {}",
                param.unwrap_or_default()
            )));
        }

        let token = decode_sasl_token(param.as_deref())?;
        match sasl.step(Some(&token)) {
            Ok(SessionStep::Continue(out)) => {
                conn.send_verb(Verb::Sasl, encode_sasl_token(&out).as_deref())
                    .await?;
                conn.expect(VerbSet::of(&[Verb::Sasl, Verb::Err]));
            }
            Ok(SessionStep::Done { output }) => {
                let identity = sasl
                    .authenticated_user()
                    .ok_or_else(|| Error::Auth("mechanism completed without identity".to_string()))?
                    .to_string();
                conn.send_verb(Verb::Ok, output.as_deref().map(|o| BASE64.encode(o)).as_deref())
                    .await?;
                let security = sasl.channel_security(Role::Server, conn.version());
                conn.finish_authentication(&identity, security);
                arc_log!(
                    conn.mask(),
                    facility::AUTH,
                    "authenticated {identity} via {} ({})",
                    sasl.mechanism(),
                    conn.version()
                );
                return Ok(());
            }
            Err(err) => {
                conn.send_err("authentication failed").await;
                return Err(err);
            }
        }
    }
}

fn decode_sasl_token(param: Option<&str>) -> Result<Vec<u8>> {
    let Some(param) = param else {
        return Ok(Vec::new());
    };
    let token = BASE64
        .decode(param.trim())
        .map_err(|_| Error::Protocol("SASL token is not valid base64".to_string()))?;
    if token.len() > MAX_SASL_TOKEN_LEN {
        return Err(Error::Protocol(format!(
            "SASL token exceeds {MAX_SASL_TOKEN_LEN} bytes"
        )));
    }
    Ok(token)
}

fn encode_sasl_token(token: &[u8]) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(BASE64.encode(token))
    }
}

// =============================================================================
// Command Dispatch
// =============================================================================

async fn dispatch_command(
    conn: &mut Connection,
    config: &Config,
    param: &str,
    active_endpoint: Option<std::net::SocketAddr>,
) -> Result<()> {
    // Structural guarantee, restated: nothing runs pre-auth.
    if !conn.is_authenticated() {
        return Err(Error::Protocol("command before authentication".to_string()));
    }

    let (name, extra_args) = parse_command_request(param)?;
    let user = conn.peer_identity().to_string();

    let Some(spec) = config.commands.get(name) else {
        // Unknown commands are recoverable like denials, but the peer
        // learns the distinction; nothing is ever spawned.
        arc_log!(conn.mask(), facility::CMD, "{user} requested unknown command '{name}'");
        conn.send_verb(Verb::Err, Some(&format!("unknown command '{name}'")))
            .await?;
        return Ok(());
    };
    if !config.acl.allows(&user, name) {
        arc_log!(conn.mask(), facility::CMD, "{user} denied '{name}' by ACL");
        return Err(Error::NotAuthorized {
            user,
            command: name.to_string(),
        });
    }

    arc_log!(conn.mask(), facility::CMD, "{user} runs '{name}' {extra_args:?}");
    let (mut child, child_output) = spawn_command(config, name, spec, &extra_args)?;

    let status = match run_data_phase(conn, &mut child, child_output, active_endpoint).await {
        Ok(status) => status,
        Err(err) => {
            // Timeout or transport failure mid-command: kill the
            // child, try to tell the peer, then give up the session.
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = conn.send_verb(Verb::Exit, Some("-1")).await;
            return Err(err);
        }
    };

    arc_log!(conn.mask(), facility::CMD, "'{name}' for {user} exited {status}");
    conn.send_verb(Verb::Exit, Some(&status.to_string())).await?;
    Ok(())
}

/// Splits a `CMD` parameter into command name and extra arguments,
/// enforcing the wire bounds.
fn parse_command_request(param: &str) -> Result<(&str, Vec<String>)> {
    let mut parts = param.split_whitespace();
    let name = parts
        .next()
        .ok_or_else(|| Error::Protocol("CMD needs a command name".to_string()))?;
    if name.len() > MAX_COMMAND_NAME_LEN {
        return Err(Error::Protocol(format!(
            "command name exceeds {MAX_COMMAND_NAME_LEN} bytes"
        )));
    }
    let args: Vec<String> = parts.map(str::to_string).collect();
    let total: usize = args.iter().map(String::len).sum();
    if total > MAX_COMMAND_ARG_LEN {
        return Err(Error::Protocol(format!(
            "command arguments exceed {MAX_COMMAND_ARG_LEN} bytes"
        )));
    }
    Ok((name, args))
}

/// Spawns the configured executable with piped stdin and a single
/// merged stdout+stderr pipe (one data channel, one byte stream).
fn spawn_command(
    config: &Config,
    name: &str,
    spec: &CommandSpec,
    extra_args: &[String],
) -> Result<(Child, pipe::Receiver)> {
    let (out_rd, out_wr) = nix::unistd::pipe().map_err(|e| Error::ChildSpawn {
        command: name.to_string(),
        reason: format!("pipe: {e}"),
    })?;
    let out_wr_stderr: OwnedFd = out_wr.try_clone().map_err(|e| Error::ChildSpawn {
        command: name.to_string(),
        reason: format!("dup: {e}"),
    })?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .args(extra_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(out_wr))
        .stderr(Stdio::from(out_wr_stderr))
        .kill_on_drop(true);
    if let Some(uid) = config.daemon.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = config.daemon.gid {
        cmd.gid(gid);
    }

    let child = cmd.spawn().map_err(|e| Error::ChildSpawn {
        command: name.to_string(),
        reason: e.to_string(),
    })?;
    let output = pipe::Receiver::from_owned_fd(out_rd).map_err(|e| Error::ChildSpawn {
        command: name.to_string(),
        reason: format!("pipe reader: {e}"),
    })?;
    Ok((child, output))
}

/// Opens the data channel, relays the child's stdio, and collects the
/// exit status.
async fn run_data_phase(
    conn: &mut Connection,
    child: &mut Child,
    child_output: pipe::Receiver,
    active_endpoint: Option<std::net::SocketAddr>,
) -> Result<i32> {
    let timeout = conn.timeout();

    let data_stream = match active_endpoint {
        // Active mode: the client listens; we connect and announce.
        Some(endpoint) => {
            let stream = data::connect(endpoint, timeout).await?;
            conn.send_verb(Verb::Data, None).await?;
            stream
        }
        // Passive mode: we listen, announce, and wait for the
        // client's connect followed by its DATA on the control
        // channel.
        None => {
            let local_ip = conn.local_addr()?.ip();
            let (listener, addr) = data::listen_ephemeral(local_ip).await?;
            conn.send_verb(Verb::Cmdpasv, Some(&addr.to_string())).await?;
            conn.expect(VerbSet::of(&[Verb::Data, Verb::Err]));
            let stream = data::accept_one(&listener, timeout).await?;
            match conn.recv_verb().await? {
                Some((Verb::Data, _)) => stream,
                Some((Verb::Err, reason)) => {
                    return Err(Error::Protocol(format!(
                        "client abandoned data channel: {}",
                        reason.unwrap_or_default()
                    )));
                }
                _ => return Err(Error::PeerClosed("awaiting DATA".to_string())),
            }
        }
    };

    arc_log!(conn.mask(), facility::SIDE, "data channel open");
    let child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Internal("child stdin was not piped".to_string()))?;

    let outcome = {
        let (tx, rx) = conn.data_security();
        data::relay(
            data_stream,
            child_output,
            child_stdin,
            tx,
            rx,
            data::RelayUntil::InputEof,
            timeout,
        )
        .await?
    };
    arc_log!(
        conn.mask(),
        facility::SIDE,
        "data channel closed ({} out, {} in)",
        outcome.sent,
        outcome.received
    );

    // Output has drained; the child should be exiting. Give it the
    // grace period before escalating.
    let status = match tokio::time::timeout(CHILD_GRACE_PERIOD, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await?
        }
    };
    Ok(exit_code(&status))
}

/// Maps an exit status to the wire integer: the code when the child
/// exited, 128+signal when it was killed.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_request() {
        let (name, args) = parse_command_request("echo hello world").unwrap();
        assert_eq!(name, "echo");
        assert_eq!(args, vec!["hello", "world"]);

        let (name, args) = parse_command_request("uptime").unwrap();
        assert_eq!(name, "uptime");
        assert!(args.is_empty());
    }

    #[test]
    fn test_parse_command_request_rejects_empty() {
        assert!(parse_command_request("").is_err());
        assert!(parse_command_request("   ").is_err());
    }

    #[test]
    fn test_parse_command_request_bounds() {
        let long_name = "x".repeat(MAX_COMMAND_NAME_LEN + 1);
        assert!(parse_command_request(&long_name).is_err());

        let long_args = format!("echo {}", "y".repeat(MAX_COMMAND_ARG_LEN + 1));
        assert!(parse_command_request(&long_args).is_err());
    }

    #[test]
    fn test_idle_set_by_version() {
        assert!(idle_set(ProtocolVersion::V2_1).contains(Verb::Cmdport));
        assert!(!idle_set(ProtocolVersion::V2_0).contains(Verb::Cmdport));
        assert!(idle_set(ProtocolVersion::V2_0).contains(Verb::Cmd));
    }
}
