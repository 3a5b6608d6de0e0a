//! Connection: the shared control-channel state both roles drive.
//!
//! One `Connection` is one authenticated session. It owns the line
//! codec, the negotiated protocol version, the SASL protection state,
//! and the expected-next verb set that gates every inbound message.
//! The client and server role drivers (`client`, `server`) own the
//! sequencing; the shared plumbing (sealing, gating, vocabulary
//! enforcement, the latched error facade) lives here.
//!
//! # Sealing
//!
//! Before authentication, control lines travel bare. After
//! authentication every outbound line is SASL-wrapped then
//! base64-encoded, and every inbound line is base64-decoded then
//! unwrapped, so the control channel stays line-safe regardless of the
//! negotiated layer.

use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::TcpStream;

use crate::codec::LineCodec;
use crate::constants::ANONYMOUS_IDENTITY;
use crate::error::{Error, ErrorLatch, Result};
use crate::log::LogMask;
use crate::protocol::{ProtocolVersion, Role, Verb, VerbSet, decode_line, encode_line};
use crate::sasl::{ChannelSecurity, Opener, Sealer};

/// One control-channel session, client or server side.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    version: ProtocolVersion,
    codec: LineCodec,
    security: ChannelSecurity,
    authenticated: bool,
    peer_identity: String,
    expected_next: VerbSet,
    command_param: Option<String>,
    latch: ErrorLatch,
    mask: LogMask,
}

impl Connection {
    /// Wraps a connected control socket.
    ///
    /// The version is pinned to [`ProtocolVersion::LATEST`] until the
    /// handshake negotiates otherwise.
    #[must_use]
    pub fn new(stream: TcpStream, role: Role, timeout: Duration, mask: LogMask) -> Self {
        Self {
            role,
            version: ProtocolVersion::LATEST,
            codec: LineCodec::new(stream, timeout),
            security: ChannelSecurity::identity(),
            authenticated: false,
            peer_identity: ANONYMOUS_IDENTITY.to_string(),
            expected_next: VerbSet::EMPTY,
            command_param: None,
            latch: ErrorLatch::new(),
            mask,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// This endpoint's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The active protocol version.
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Pins the negotiated protocol version.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// True once SASL completed with a non-empty peer identity.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The authenticated peer identity, or `"anonymous"` before
    /// authentication. Never used for authorization pre-auth.
    #[must_use]
    pub fn peer_identity(&self) -> &str {
        &self.peer_identity
    }

    /// The configured log mask.
    #[must_use]
    pub fn mask(&self) -> LogMask {
        self.mask
    }

    /// Per-call I/O timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.codec.timeout()
    }

    /// Local address of the control socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.codec.local_addr()
    }

    /// Peer address of the control socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.codec.peer_addr()
    }

    /// The most recent `CMD` argument string.
    #[must_use]
    pub fn command_param(&self) -> Option<&str> {
        self.command_param.as_deref()
    }

    /// Records the latest `CMD` argument string.
    pub fn set_command_param(&mut self, param: Option<String>) {
        self.command_param = param;
    }

    /// The latched error façade.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.latch.get()
    }

    /// Latches a failure context and returns the error unchanged, so
    /// call sites read `return Err(self.fail(err))`.
    pub fn fail(&mut self, err: Error) -> Error {
        self.latch.latch(err.to_string());
        err
    }

    /// Latches a failure context that is not an [`Error`] of ours,
    /// such as a reason string the peer reported.
    pub fn note_error(&mut self, msg: impl Into<String>) {
        self.latch.latch(msg);
    }

    /// Clears the latch at the start of a new logical operation.
    pub fn clear_error(&mut self) {
        self.latch.clear();
    }

    // =========================================================================
    // Expected-Next Gating
    // =========================================================================

    /// Replaces the set of verbs the peer may send next.
    pub fn expect(&mut self, set: VerbSet) {
        self.expected_next = set;
    }

    /// The current expected-next set. Empty means end of session.
    #[must_use]
    pub fn expected(&self) -> VerbSet {
        self.expected_next
    }

    // =========================================================================
    // Authentication Hand-Off
    // =========================================================================

    /// Marks the session authenticated and installs the negotiated
    /// protection state. All subsequent traffic is sealed.
    pub fn finish_authentication(&mut self, identity: &str, security: ChannelSecurity) {
        self.authenticated = true;
        self.peer_identity = identity.to_string();
        self.security = security;
    }

    /// Borrows the data-channel protection state for a relay.
    ///
    /// Sequence numbers persist across commands within the session, so
    /// a frame captured during one command cannot replay into a later
    /// one.
    pub fn data_security(&mut self) -> (&mut Sealer, &mut Opener) {
        (&mut self.security.data_tx, &mut self.security.data_rx)
    }

    // =========================================================================
    // Verb I/O
    // =========================================================================

    /// Sends one verb with an optional payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the verb is outside the active
    /// version's vocabulary (a bug in the role driver), or the codec's
    /// timeout / I/O errors.
    pub async fn send_verb(&mut self, verb: Verb, param: Option<&str>) -> Result<()> {
        if !self.version.admits(verb) {
            return Err(Error::Internal(format!(
                "verb {verb} is not in the {} vocabulary",
                self.version
            )));
        }
        let line = encode_line(verb, param);
        tracing::trace!(role = %self.role, verb = %verb, "send");
        if self.authenticated {
            let sealed = self.security.control_tx.seal(line.as_bytes());
            let wire = BASE64.encode(sealed);
            self.codec.send_line(wire.as_bytes()).await
        } else {
            self.codec.send_line(line.as_bytes()).await
        }
    }

    /// Receives the next verb, enforcing the expected-next set.
    ///
    /// `Ok(None)` is a clean end-of-stream; whether that is an error
    /// depends on session state, so the role drivers decide.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] on a malformed line, a verb outside the
    ///   vocabulary, or a verb outside the expected-next set.
    /// - The codec's timeout, peer-closed, and I/O errors.
    pub async fn recv_verb(&mut self) -> Result<Option<(Verb, Option<String>)>> {
        let Some(wire) = self.codec.recv_line().await? else {
            return Ok(None);
        };

        let line = if self.authenticated {
            let sealed = BASE64
                .decode(wire.trim())
                .map_err(|_| Error::Protocol("control line is not valid base64".to_string()))?;
            let plain = self.security.control_rx.open(&sealed)?;
            String::from_utf8(plain)
                .map_err(|_| Error::Protocol("unsealed line is not UTF-8".to_string()))?
        } else {
            wire
        };

        let (verb, param) = decode_line(&line)?;
        if !self.version.admits(verb) {
            return Err(Error::Protocol(format!(
                "verb {verb} is not in the {} vocabulary",
                self.version
            )));
        }
        if !self.expected_next.contains(verb) {
            return Err(Error::Protocol(format!(
                "unexpected {verb}, expected {}",
                self.expected_next
            )));
        }
        tracing::trace!(role = %self.role, verb = %verb, "recv");
        Ok(Some((verb, param)))
    }

    /// Best-effort `ERR` with a reason; failures to send are ignored
    /// because the connection is usually already dying.
    pub async fn send_err(&mut self, reason: &str) {
        let _ = self.send_verb(Verb::Err, Some(reason)).await;
    }

    /// Shuts down the control socket's write half.
    pub async fn shutdown(&mut self) {
        self.expected_next = VerbSet::EMPTY;
        self.codec.shutdown().await;
    }
}
