//! Client role: initiator handshake and command requests.
//!
//! A [`ClientSession`] drives one authenticated session: connect,
//! authenticate, then any number of [`ClientSession::run`] calls (each
//! one command with its stdio relayed over a fresh data channel)
//! until [`ClientSession::quit`].
//!
//! The generic reader/writer on `run` lets the CLI pass process
//! stdin/stdout while tests pass in-memory pipes.

use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::arc_log;
use crate::conn::Connection;
use crate::data;
use crate::error::{Error, Result};
use crate::log::{LogMask, facility};
use crate::protocol::{ProtocolVersion, Role, Verb, VerbSet};
use crate::sasl::{SaslSession, SessionStep};

/// Client-side session parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Authentication identity.
    pub user: String,
    /// Authentication secret.
    pub secret: String,
    /// Mechanisms to offer, preference order.
    pub mechanisms: Vec<String>,
    /// Highest protocol version to request.
    pub version: ProtocolVersion,
    /// Use active (`CMDPORT`) data channels. Requires ARC/2.1.
    pub active_data: bool,
    /// Per-call I/O timeout.
    pub timeout: Duration,
    /// Log facility mask.
    pub mask: LogMask,
}

impl ClientOptions {
    /// Options for `user`/`secret` with every other field defaulted.
    #[must_use]
    pub fn new(user: &str, secret: &str) -> Self {
        Self {
            user: user.to_string(),
            secret: secret.to_string(),
            mechanisms: crate::sasl::SUPPORTED_MECHANISMS
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            version: ProtocolVersion::LATEST,
            active_data: false,
            timeout: crate::constants::DEFAULT_TIMEOUT,
            mask: LogMask::DEFAULT,
        }
    }
}

/// One authenticated client session.
#[derive(Debug)]
pub struct ClientSession {
    conn: Connection,
    options: ClientOptions,
}

impl ClientSession {
    /// Connects and authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`]/[`Error::Timeout`] for connect failures
    /// and [`Error::Auth`]/[`Error::Protocol`] for handshake failures.
    pub async fn connect(addr: SocketAddr, options: ClientOptions) -> Result<Self> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(options.timeout))??;
        let conn = Connection::new(stream, Role::Client, options.timeout, options.mask);
        let mut session = Self { conn, options };
        session.authenticate().await?;
        Ok(session)
    }

    /// The negotiated protocol version.
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.conn.version()
    }

    /// The latched error façade, for callers that inspect failures
    /// after the fact.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.conn.last_error()
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn authenticate(&mut self) -> Result<()> {
        let offer = self.options.mechanisms.join(",");
        self.conn
            .send_verb(
                Verb::Auth,
                Some(&format!("{} {offer}", self.options.version)),
            )
            .await?;
        self.conn.expect(VerbSet::of(&[Verb::Ok, Verb::Err]));

        let Some((verb, param)) = self.conn.recv_verb().await? else {
            return Err(Error::PeerClosed("awaiting AUTH reply".to_string()));
        };
        if verb == Verb::Err {
            return Err(Error::Auth(param.unwrap_or_default()));
        }

        let param = param.unwrap_or_default();
        let (version_token, mech) = param
            .split_once(' ')
            .ok_or_else(|| Error::Protocol("OK needs '<version> <mechanism>'".to_string()))?;
        let version = ProtocolVersion::parse(version_token)
            .ok_or_else(|| Error::Protocol(format!("unknown version '{version_token}'")))?;
        if version > self.options.version {
            return Err(Error::Protocol(format!(
                "server negotiated {version} above our request"
            )));
        }
        self.conn.set_version(version);
        if !self
            .options
            .mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mech))
        {
            return Err(Error::Auth(format!(
                "server chose unoffered mechanism '{mech}'"
            )));
        }

        let mut sasl = SaslSession::client(mech, &self.options.user, &self.options.secret)?;
        let SessionStep::Continue(initial) = sasl.step(None)? else {
            return Err(Error::Auth("mechanism produced no initial token".to_string()));
        };
        self.conn
            .send_verb(Verb::Sasl, encode_token(&initial).as_deref())
            .await?;
        self.conn
            .expect(VerbSet::of(&[Verb::Sasl, Verb::Ok, Verb::Err]));

        loop {
            let Some((verb, param)) = self.conn.recv_verb().await? else {
                return Err(Error::PeerClosed("during SASL exchange".to_string()));
            };
            match verb {
                Verb::Err => return Err(Error::Auth(param.unwrap_or_default())),
                Verb::Sasl => {
                    let token = decode_token(param.as_deref())?;
                    match sasl.step(Some(&token))? {
                        SessionStep::Continue(out) => {
                            self.conn
                                .send_verb(Verb::Sasl, encode_token(&out).as_deref())
                                .await?;
                            self.conn
                                .expect(VerbSet::of(&[Verb::Sasl, Verb::Ok, Verb::Err]));
                        }
                        SessionStep::Done { .. } => {
                            // Our mechanisms finish on the server's OK,
                            // never mid-exchange.
                            return Err(Error::Auth(
                                "mechanism completed before server OK".to_string(),
                            ));
                        }
                    }
                }
                Verb::Ok => {
                    let input = param
                        .as_deref()
                        .map(decode_token_str)
                        .transpose()?;
                    let SessionStep::Done { .. } = sasl.step(input.as_deref())? else {
                        return Err(Error::Auth(
                            "server OK before mechanism completion".to_string(),
                        ));
                    };
                    let identity = sasl
                        .authenticated_user()
                        .ok_or_else(|| Error::Auth("no authenticated identity".to_string()))?
                        .to_string();
                    let security = sasl.channel_security(Role::Client, self.conn.version());
                    self.conn.finish_authentication(&identity, security);
                    arc_log!(
                        self.options.mask,
                        facility::AUTH,
                        "authenticated as {identity} via {} ({})",
                        sasl.mechanism(),
                        self.conn.version()
                    );
                    self.conn.expect(VerbSet::EMPTY);
                    return Ok(());
                }
                other => {
                    return Err(Error::Protocol(format!("unexpected {other} in handshake")));
                }
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Runs one remote command, relaying `input`/`output` over the
    /// data channel, and returns its exit status.
    ///
    /// A denial or unknown command returns
    /// [`Error::NotAuthorized`]; the session stays usable.
    ///
    /// # Errors
    ///
    /// Fatal transport, protocol, or timeout errors end the session.
    pub async fn run<I, O>(
        &mut self,
        command: &str,
        args: &[String],
        input: I,
        output: O,
    ) -> Result<i32>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        self.conn.clear_error();
        let request = if args.is_empty() {
            command.to_string()
        } else {
            format!("{command} {}", args.join(" "))
        };

        // Active mode announces our listener before the request.
        let listener = if self.options.active_data {
            if !self.conn.version().admits(Verb::Cmdport) {
                return Err(Error::Protocol(format!(
                    "{} does not support CMDPORT",
                    self.conn.version()
                )));
            }
            let local_ip = self.conn.local_addr()?.ip();
            let (listener, addr) = data::listen_ephemeral(local_ip).await?;
            self.conn
                .send_verb(Verb::Cmdport, Some(&addr.to_string()))
                .await?;
            self.conn.expect(VerbSet::of(&[Verb::Ok, Verb::Err]));
            match self.conn.recv_verb().await? {
                Some((Verb::Ok, _)) => Some(listener),
                Some((Verb::Err, reason)) => {
                    return Err(Error::Protocol(format!(
                        "server refused CMDPORT: {}",
                        reason.unwrap_or_default()
                    )));
                }
                _ => return Err(Error::PeerClosed("awaiting CMDPORT reply".to_string())),
            }
        } else {
            None
        };

        self.conn.send_verb(Verb::Cmd, Some(&request)).await?;
        arc_log!(self.options.mask, facility::CMD, "requested '{request}'");

        let data_stream = match &listener {
            Some(listener) => {
                // The server either connects and confirms with DATA,
                // or refuses the command with ERR, in which case it
                // never connects, so wait for whichever comes first.
                self.conn.expect(VerbSet::of(&[Verb::Data, Verb::Err]));
                let timeout = self.options.timeout;
                tokio::select! {
                    accepted = data::accept_one(listener, timeout) => {
                        let stream = accepted?;
                        match self.conn.recv_verb().await? {
                            Some((Verb::Data, _)) => stream,
                            Some((Verb::Err, reason)) => {
                                return Err(self.denied(command, reason));
                            }
                            _ => return Err(Error::PeerClosed("awaiting DATA".to_string())),
                        }
                    }
                    verb = self.conn.recv_verb() => {
                        match verb? {
                            Some((Verb::Data, _)) => {
                                data::accept_one(listener, timeout).await?
                            }
                            Some((Verb::Err, reason)) => {
                                return Err(self.denied(command, reason));
                            }
                            _ => return Err(Error::PeerClosed("awaiting DATA".to_string())),
                        }
                    }
                }
            }
            None => {
                self.conn.expect(VerbSet::of(&[Verb::Cmdpasv, Verb::Err]));
                match self.conn.recv_verb().await? {
                    Some((Verb::Cmdpasv, endpoint)) => {
                        let addr = data::parse_endpoint(endpoint.as_deref().unwrap_or_default())?;
                        let stream = data::connect(addr, self.options.timeout).await?;
                        self.conn.send_verb(Verb::Data, None).await?;
                        stream
                    }
                    Some((Verb::Err, reason)) => return Err(self.denied(command, reason)),
                    _ => return Err(Error::PeerClosed("awaiting CMDPASV".to_string())),
                }
            }
        };

        arc_log!(self.options.mask, facility::SIDE, "data channel open");
        let outcome = {
            let timeout = self.options.timeout;
            let (tx, rx) = self.conn.data_security();
            data::relay(
                data_stream,
                input,
                output,
                tx,
                rx,
                data::RelayUntil::NetEof,
                timeout,
            )
            .await?
        };
        arc_log!(
            self.options.mask,
            facility::SIDE,
            "data channel closed ({} out, {} in)",
            outcome.sent,
            outcome.received
        );

        self.conn.expect(VerbSet::of(&[Verb::Exit, Verb::Err]));
        match self.conn.recv_verb().await? {
            Some((Verb::Exit, status)) => {
                let status: i32 = status
                    .as_deref()
                    .unwrap_or_default()
                    .trim()
                    .parse()
                    .map_err(|_| Error::Protocol("EXIT status is not an integer".to_string()))?;
                arc_log!(self.options.mask, facility::CMD, "'{command}' exited {status}");
                self.conn.expect(VerbSet::EMPTY);
                Ok(status)
            }
            Some((Verb::Err, reason)) => Err(self.denied(command, reason)),
            _ => Err(Error::PeerClosed("awaiting EXIT".to_string())),
        }
    }

    /// Maps a server `ERR` during command setup to the recoverable
    /// denial error, latching the server's reason.
    fn denied(&mut self, command: &str, reason: Option<String>) -> Error {
        let reason = reason.unwrap_or_else(|| "refused".to_string());
        self.conn.expect(VerbSet::EMPTY);
        self.conn.note_error(reason);
        Error::NotAuthorized {
            user: self.options.user.clone(),
            command: command.to_string(),
        }
    }

    /// Gracefully ends the session.
    ///
    /// # Errors
    ///
    /// Returns transport errors from sending `QUIT`; the server's
    /// farewell is awaited best-effort.
    pub async fn quit(mut self) -> Result<()> {
        self.conn.send_verb(Verb::Quit, None).await?;
        self.conn.expect(VerbSet::of(&[Verb::Ok, Verb::Err]));
        let _ = self.conn.recv_verb().await;
        self.conn.shutdown().await;
        arc_log!(self.options.mask, facility::USER, "session closed");
        Ok(())
    }
}

fn encode_token(token: &[u8]) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(BASE64.encode(token))
    }
}

fn decode_token(param: Option<&str>) -> Result<Vec<u8>> {
    match param {
        Some(p) => decode_token_str(p),
        None => Ok(Vec::new()),
    }
}

fn decode_token_str(param: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(param.trim())
        .map_err(|_| Error::Protocol("SASL token is not valid base64".to_string()))
}
