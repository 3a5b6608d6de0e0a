//! ARC wire protocol: verbs, versions, and expected-next gating.
//!
//! The control channel carries ASCII lines of the form
//! `VERB[ SPACE payload]CRLF`. This module owns the verb vocabulary,
//! the two protocol versions and which verbs each admits, line
//! parse/encode, and the [`VerbSet`] type that tracks which verbs the
//! peer may legally send next.
//!
//! # Handshake
//!
//! ```text
//! Client                                Server
//!   |  AUTH ARC/2.1 SCRAM-SHA-256,PLAIN  |
//!   |----------------------------------->|
//!   |  OK ARC/2.1 SCRAM-SHA-256          |
//!   |<-----------------------------------|
//!   |  SASL <base64 token>               |
//!   |<---------------------------------->|   (one or more rounds)
//!   |  OK [<base64 final token>]         |
//!   |<-----------------------------------|
//! ```
//!
//! After the final `OK` every control line is SASL-wrapped, then
//! base64-encoded, then CRLF-framed.

use std::fmt;

use crate::error::{Error, Result};

// =============================================================================
// Roles
// =============================================================================

/// Which side of the connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator: drives the handshake, issues commands.
    Client,
    /// Responder: authenticates, authorizes, executes.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

// =============================================================================
// Verbs
// =============================================================================

/// One message verb of the ARC protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// C→S: begin negotiation; payload is `<version> <mech,mech,...>`.
    Auth,
    /// Both: one SASL round; payload is a base64 token (may be absent).
    Sasl,
    /// S→C: handshake or step accepted; optional payload.
    Ok,
    /// Either: protocol or authorization failure.
    Err,
    /// C→S: request a privileged command; payload is `name [args...]`.
    Cmd,
    /// S→C: server listens for the data channel; payload is `host:port`.
    Cmdpasv,
    /// C→S: client listens for the data channel; payload is `host:port`.
    /// ARC/2.1 only.
    Cmdport,
    /// Either: begin relaying on the data channel.
    Data,
    /// S→C: command exit status; payload is a decimal integer.
    Exit,
    /// C→S: graceful close.
    Quit,
}

impl Verb {
    /// All verbs, in wire-table order.
    pub const ALL: [Verb; 10] = [
        Verb::Auth,
        Verb::Sasl,
        Verb::Ok,
        Verb::Err,
        Verb::Cmd,
        Verb::Cmdpasv,
        Verb::Cmdport,
        Verb::Data,
        Verb::Exit,
        Verb::Quit,
    ];

    /// The uppercase wire token for this verb.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Auth => "AUTH",
            Verb::Sasl => "SASL",
            Verb::Ok => "OK",
            Verb::Err => "ERR",
            Verb::Cmd => "CMD",
            Verb::Cmdpasv => "CMDPASV",
            Verb::Cmdport => "CMDPORT",
            Verb::Data => "DATA",
            Verb::Exit => "EXIT",
            Verb::Quit => "QUIT",
        }
    }

    /// Parses a wire token. Case-sensitive: verbs are uppercase ASCII.
    #[must_use]
    pub fn parse(token: &str) -> Option<Verb> {
        Verb::ALL.into_iter().find(|v| v.as_str() == token)
    }

    const fn bit(self) -> u16 {
        match self {
            Verb::Auth => 1 << 0,
            Verb::Sasl => 1 << 1,
            Verb::Ok => 1 << 2,
            Verb::Err => 1 << 3,
            Verb::Cmd => 1 << 4,
            Verb::Cmdpasv => 1 << 5,
            Verb::Cmdport => 1 << 6,
            Verb::Data => 1 << 7,
            Verb::Exit => 1 << 8,
            Verb::Quit => 1 << 9,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Verb Sets
// =============================================================================

/// A small set of verbs: the peer's permitted next messages.
///
/// An empty set means end of session: nothing further is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerbSet(u16);

impl VerbSet {
    /// The empty set.
    pub const EMPTY: VerbSet = VerbSet(0);

    /// Builds a set from a slice of verbs.
    #[must_use]
    pub const fn of(verbs: &[Verb]) -> VerbSet {
        let mut bits = 0u16;
        let mut i = 0;
        while i < verbs.len() {
            bits |= verbs[i].bit();
            i += 1;
        }
        VerbSet(bits)
    }

    /// True if `verb` is in the set.
    #[must_use]
    pub const fn contains(self, verb: Verb) -> bool {
        self.0 & verb.bit() != 0
    }

    /// True if no verb is permitted (end of session).
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The set minus `verb`.
    #[must_use]
    pub const fn without(self, verb: Verb) -> VerbSet {
        VerbSet(self.0 & !verb.bit())
    }
}

impl fmt::Display for VerbSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for verb in Verb::ALL {
            if self.contains(verb) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(verb.as_str())?;
                first = false;
            }
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

// =============================================================================
// Protocol Versions
// =============================================================================

/// Negotiated protocol version. Pins the verb vocabulary and whether
/// the per-message integrity layer may engage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// ARC/2.0: no `CMDPORT`, no integrity layer.
    V2_0,
    /// ARC/2.1: full vocabulary, integrity layer when the mechanism
    /// yields session keys.
    V2_1,
}

impl ProtocolVersion {
    /// The newest version this implementation speaks.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V2_1;

    /// The wire string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V2_0 => "ARC/2.0",
            ProtocolVersion::V2_1 => "ARC/2.1",
        }
    }

    /// Parses a wire version string.
    #[must_use]
    pub fn parse(token: &str) -> Option<ProtocolVersion> {
        match token {
            "ARC/2.0" => Some(ProtocolVersion::V2_0),
            "ARC/2.1" => Some(ProtocolVersion::V2_1),
            _ => None,
        }
    }

    /// True if `verb` exists in this version's vocabulary.
    #[must_use]
    pub fn admits(self, verb: Verb) -> bool {
        match verb {
            Verb::Cmdport => self >= ProtocolVersion::V2_1,
            _ => true,
        }
    }

    /// True if sessions at this version run the integrity layer when
    /// the mechanism provides session keys.
    #[must_use]
    pub fn supports_layer(self) -> bool {
        self >= ProtocolVersion::V2_1
    }

    /// Version negotiation: the newer common version.
    #[must_use]
    pub fn negotiate(client: ProtocolVersion, server: ProtocolVersion) -> ProtocolVersion {
        client.min(server)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Line Encode/Decode
// =============================================================================

/// Encodes a verb and optional payload as one control line (no CRLF).
#[must_use]
pub fn encode_line(verb: Verb, param: Option<&str>) -> String {
    match param {
        Some(p) if !p.is_empty() => format!("{} {}", verb.as_str(), p),
        _ => verb.as_str().to_string(),
    }
}

/// Decodes one control line into verb and payload.
///
/// # Errors
///
/// Returns [`Error::Protocol`] on an empty line or an unknown verb.
pub fn decode_line(line: &str) -> Result<(Verb, Option<String>)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(Error::Protocol("empty control line".to_string()));
    }
    let (token, param) = match line.split_once(' ') {
        Some((token, rest)) => (token, Some(rest.to_string())),
        None => (line, None),
    };
    let verb = Verb::parse(token)
        .ok_or_else(|| Error::Protocol(format!("unknown verb '{token}'")))?;
    Ok((verb, param))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip() {
        for verb in Verb::ALL {
            assert_eq!(Verb::parse(verb.as_str()), Some(verb));
        }
        assert_eq!(Verb::parse("NOPE"), None);
        assert_eq!(Verb::parse("cmd"), None);
    }

    #[test]
    fn test_verb_set_membership() {
        let set = VerbSet::of(&[Verb::Cmd, Verb::Quit]);
        assert!(set.contains(Verb::Cmd));
        assert!(set.contains(Verb::Quit));
        assert!(!set.contains(Verb::Auth));
        assert!(!set.is_empty());
        assert!(VerbSet::EMPTY.is_empty());
    }

    #[test]
    fn test_verb_set_without() {
        let set = VerbSet::of(&[Verb::Cmd, Verb::Quit]).without(Verb::Cmd);
        assert!(!set.contains(Verb::Cmd));
        assert!(set.contains(Verb::Quit));
    }

    #[test]
    fn test_version_vocabulary() {
        assert!(!ProtocolVersion::V2_0.admits(Verb::Cmdport));
        assert!(ProtocolVersion::V2_1.admits(Verb::Cmdport));
        assert!(ProtocolVersion::V2_0.admits(Verb::Cmd));
        assert!(!ProtocolVersion::V2_0.supports_layer());
        assert!(ProtocolVersion::V2_1.supports_layer());
    }

    #[test]
    fn test_version_negotiate() {
        assert_eq!(
            ProtocolVersion::negotiate(ProtocolVersion::V2_0, ProtocolVersion::V2_1),
            ProtocolVersion::V2_0
        );
        assert_eq!(
            ProtocolVersion::negotiate(ProtocolVersion::V2_1, ProtocolVersion::V2_1),
            ProtocolVersion::V2_1
        );
    }

    #[test]
    fn test_encode_decode() {
        let line = encode_line(Verb::Cmd, Some("echo hello world"));
        assert_eq!(line, "CMD echo hello world");
        let (verb, param) = decode_line(&line).unwrap();
        assert_eq!(verb, Verb::Cmd);
        assert_eq!(param.as_deref(), Some("echo hello world"));

        let line = encode_line(Verb::Quit, None);
        assert_eq!(line, "QUIT");
        let (verb, param) = decode_line("QUIT\r\n").unwrap();
        assert_eq!(verb, Verb::Quit);
        assert_eq!(param, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_line("").is_err());
        assert!(decode_line("\r\n").is_err());
        assert!(decode_line("LAUNCH missiles").is_err());
    }
}
