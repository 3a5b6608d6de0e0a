//! Data channel: the secondary TCP stream carrying a command's stdio.
//!
//! One data channel exists per command, opened between the
//! `CMDPASV`/`CMDPORT` exchange and end-of-command. The listening side
//! binds an ephemeral port on the same interface as the control socket
//! and accepts exactly one peer within the timeout.
//!
//! # Relay
//!
//! The relay couples a local read/write pair (stdio, or pipes to a
//! child) with the data socket:
//!
//! ```text
//!   local in  ──read──► seal ──write──►  data socket
//!   data socket ──read──► open ──write──► local out
//! ```
//!
//! Local-input EOF half-closes the socket's write direction; socket
//! EOF closes the local output. Which EOF finishes the relay depends
//! on the role (see [`RelayUntil`]). Every blocking step is bounded by
//! the connection timeout.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::constants::RELAY_BUF_LEN;
use crate::error::{Error, Result};
use crate::sasl::{Opener, Sealer};

// =============================================================================
// Channel Setup
// =============================================================================

/// Binds an ephemeral port on `local_ip` for one data connection and
/// returns the listener with its advertised address.
///
/// # Errors
///
/// Returns [`Error::Bind`] if the ephemeral bind fails.
pub async fn listen_ephemeral(local_ip: std::net::IpAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((local_ip, 0))
        .await
        .map_err(|source| Error::Bind {
            addr: format!("{local_ip}:0"),
            source,
        })?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Accepts exactly one data connection within the timeout.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if no peer connects in the window.
pub async fn accept_one(listener: &TcpListener, timeout: Duration) -> Result<TcpStream> {
    let (stream, _) = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    Ok(stream)
}

/// Connects to the peer's advertised data endpoint within the timeout.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the connection does not establish in
/// the window, or the underlying I/O error.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(timeout))??;
    Ok(stream)
}

/// Parses a `host:port` endpoint parameter.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the parameter is not a socket
/// address (IPv6 must be bracketed).
pub fn parse_endpoint(param: &str) -> Result<SocketAddr> {
    param
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("bad data endpoint '{param}'")))
}

// =============================================================================
// Relay
// =============================================================================

/// Byte counts from a completed relay, for side-channel logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayOutcome {
    /// Plaintext bytes sent from local input to the peer.
    pub sent: u64,
    /// Plaintext bytes received from the peer into local output.
    pub received: u64,
}

/// Which end-of-stream finishes the relay.
///
/// The two roles end differently: the server is done when the child's
/// output is exhausted (the command finished; any unread client input
/// is moot), while the client is done when the socket drains (the
/// command finished remotely; its own stdin may well never close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayUntil {
    /// Local-input EOF ends the relay (server side).
    InputEof,
    /// Socket EOF ends the relay (client side).
    NetEof,
}

/// Relays between a local read/write pair and the data socket until
/// the role's finishing EOF (see [`RelayUntil`]) arrives.
///
/// `input` feeds the socket (sealed); socket bytes feed `output`
/// (opened). Input EOF half-closes the socket's write direction so
/// the peer observes end-of-command. Socket EOF *drops* `output`:
/// for a child's stdin that close is the EOF the command is waiting
/// on; `AsyncWrite::shutdown` would only flush a pipe, not close it.
/// Output write failures are treated as output closure, not errors,
/// so a command that exits without draining its stdin does not kill
/// the session.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if no direction makes progress within
/// the window, [`Error::Protocol`] on an integrity-layer violation, or
/// the underlying I/O error.
pub async fn relay<I, O>(
    data: TcpStream,
    mut input: I,
    output: O,
    tx: &mut Sealer,
    rx: &mut Opener,
    until: RelayUntil,
    timeout: Duration,
) -> Result<RelayOutcome>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (mut data_rd, mut data_wr) = data.into_split();
    let mut output = Some(output);
    let mut in_buf = vec![0u8; RELAY_BUF_LEN];
    let mut net_buf = vec![0u8; RELAY_BUF_LEN];
    let mut in_done = false;
    let mut net_done = false;
    let mut outcome = RelayOutcome::default();

    loop {
        let finished = match until {
            RelayUntil::InputEof => in_done,
            RelayUntil::NetEof => net_done,
        };
        if finished || (in_done && net_done) {
            break;
        }
        let step = async {
            tokio::select! {
                read = input.read(&mut in_buf), if !in_done => {
                    let n = read?;
                    if n == 0 {
                        in_done = true;
                        data_wr.shutdown().await?;
                    } else {
                        let sealed = tx.seal(&in_buf[..n]);
                        data_wr.write_all(&sealed).await?;
                        data_wr.flush().await?;
                        outcome.sent += n as u64;
                    }
                    Ok::<(), Error>(())
                }
                read = data_rd.read(&mut net_buf), if !net_done => {
                    let n = read?;
                    if n == 0 {
                        net_done = true;
                        if let Some(mut out) = output.take() {
                            let _ = out.flush().await;
                        }
                    } else {
                        rx.push(&net_buf[..n]);
                        let plain = rx.drain()?;
                        if !plain.is_empty() {
                            // The local consumer may be gone (a child
                            // that exited without reading its stdin);
                            // discard the remainder rather than fail.
                            let mut write_failed = false;
                            if let Some(out) = output.as_mut() {
                                match out.write_all(&plain).await {
                                    Ok(()) => {
                                        out.flush().await?;
                                        outcome.received += plain.len() as u64;
                                    }
                                    Err(_) => write_failed = true,
                                }
                            }
                            if write_failed {
                                output = None;
                            }
                        }
                    }
                    Ok(())
                }
            }
        };

        tokio::time::timeout(timeout, step)
            .await
            .map_err(|_| Error::Timeout(timeout))??;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let addr = parse_endpoint("127.0.0.1:4300").unwrap();
        assert_eq!(addr.port(), 4300);
        let addr = parse_endpoint("[::1]:9").unwrap();
        assert!(addr.is_ipv6());
        assert!(parse_endpoint("localhost:x").is_err());
        assert!(parse_endpoint("4300").is_err());
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let (listener, addr) = listen_ephemeral("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let timeout = Duration::from_secs(2);
        let (client, server) = tokio::join!(
            connect(addr, timeout),
            accept_one(&listener, timeout)
        );
        assert!(client.is_ok());
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_accept_times_out_without_peer() {
        let (listener, _) = listen_ephemeral("127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let err = accept_one(&listener, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
