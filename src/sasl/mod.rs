//! SASL adapter: mechanism negotiation, the exchange state machine,
//! and the per-message protection layer.
//!
//! The ARC engine never talks to a mechanism directly; it drives a
//! [`SaslSession`], which hides which mechanism is in play and how many
//! rounds it needs. Mechanisms implement the small [`Mechanism`] trait;
//! the server verifies credentials through the [`SecretStore`] seam.
//!
//! Shipped mechanisms:
//!
//! | Name            | Rounds | Protection layer        |
//! |-----------------|--------|-------------------------|
//! | `SCRAM-SHA-256` | 2      | integrity (ARC/2.1)     |
//! | `PLAIN`         | 1      | none                    |

mod layer;
mod plain;
mod scram;

pub use layer::{Opener, Sealer, SessionKeys};

use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::MAX_SASL_ROUNDS;
use crate::error::{Error, Result};
use crate::protocol::{ProtocolVersion, Role};

// =============================================================================
// Mechanism Seam
// =============================================================================

/// Outcome of one mechanism round.
pub enum Step {
    /// Send these bytes to the peer and wait for its next token.
    Continue(Vec<u8>),
    /// Exchange complete.
    Done {
        /// The authenticated identity. Never empty.
        identity: String,
        /// Session keys, if the mechanism provides key material.
        keys: Option<SessionKeys>,
        /// Final bytes for the peer (rides in the closing `OK`).
        output: Option<Vec<u8>>,
    },
}

/// One SASL mechanism, client or server side.
///
/// `step` is called with `None` for a round the caller initiates (the
/// client's first move, or a bare `OK` completion) and `Some(token)`
/// for a round driven by peer input.
pub trait Mechanism: Send {
    /// The IANA mechanism name.
    fn name(&self) -> &'static str;

    /// Advances the exchange one round.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on any verification or format failure;
    /// the exchange cannot continue afterwards.
    fn step(&mut self, input: Option<&[u8]>) -> Result<Step>;
}

/// Server-side credential lookup.
pub trait SecretStore: Send + Sync {
    /// Returns the secret for `user`, or `None` if unknown.
    fn lookup(&self, user: &str) -> Option<String>;
}

/// In-memory secret store backed by the `[users]` config section.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    secrets: HashMap<String, String>,
}

impl MemoryStore {
    /// Builds a store from a user → secret map.
    #[must_use]
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Convenience constructor for tests.
    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            secrets: pairs
                .iter()
                .map(|(u, s)| (u.to_string(), s.to_string()))
                .collect(),
        }
    }
}

impl SecretStore for MemoryStore {
    fn lookup(&self, user: &str) -> Option<String> {
        self.secrets.get(user).cloned()
    }
}

// =============================================================================
// Negotiation
// =============================================================================

/// Mechanism names this build supports, strongest first.
pub const SUPPORTED_MECHANISMS: [&str; 2] = [scram::MECH_NAME, plain::MECH_NAME];

/// Picks the mechanism to run: the first entry of the server's
/// preference list that the client also offered and this build
/// supports. Deterministic in the server's list order.
#[must_use]
pub fn select_mechanism(server_prefs: &[String], client_offer: &[&str]) -> Option<&'static str> {
    server_prefs
        .iter()
        .filter_map(|pref| {
            SUPPORTED_MECHANISMS
                .into_iter()
                .find(|supported| supported.eq_ignore_ascii_case(pref))
        })
        .find(|candidate| {
            client_offer
                .iter()
                .any(|offered| offered.eq_ignore_ascii_case(candidate))
        })
}

// =============================================================================
// Session
// =============================================================================

/// Outcome of one [`SaslSession::step`].
pub enum SessionStep {
    /// Send these bytes and await the peer.
    Continue(Vec<u8>),
    /// Authentication complete; `output` (if any) still goes to the
    /// peer in the closing `OK`.
    Done { output: Option<Vec<u8>> },
}

/// One authentication exchange, client or server side.
pub struct SaslSession {
    mechanism: Box<dyn Mechanism>,
    identity: Option<String>,
    keys: Option<SessionKeys>,
    rounds: usize,
}

impl SaslSession {
    /// Prepares the initiator side for `mech`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] for an unsupported mechanism name.
    pub fn client(mech: &str, user: &str, secret: &str) -> Result<Self> {
        let mechanism: Box<dyn Mechanism> = if mech.eq_ignore_ascii_case(scram::MECH_NAME) {
            Box::new(scram::ScramClient::new(user, secret))
        } else if mech.eq_ignore_ascii_case(plain::MECH_NAME) {
            Box::new(plain::PlainClient::new(user, secret))
        } else {
            return Err(Error::Auth(format!("unsupported mechanism '{mech}'")));
        };
        Ok(Self::new(mechanism))
    }

    /// Prepares the responder side for `mech`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] for an unsupported mechanism name.
    pub fn server(mech: &str, store: Arc<dyn SecretStore>) -> Result<Self> {
        let mechanism: Box<dyn Mechanism> = if mech.eq_ignore_ascii_case(scram::MECH_NAME) {
            Box::new(scram::ScramServer::new(store))
        } else if mech.eq_ignore_ascii_case(plain::MECH_NAME) {
            Box::new(plain::PlainServer::new(store))
        } else {
            return Err(Error::Auth(format!("unsupported mechanism '{mech}'")));
        };
        Ok(Self::new(mechanism))
    }

    fn new(mechanism: Box<dyn Mechanism>) -> Self {
        Self {
            mechanism,
            identity: None,
            keys: None,
            rounds: 0,
        }
    }

    /// The running mechanism's name.
    #[must_use]
    pub fn mechanism(&self) -> &'static str {
        self.mechanism.name()
    }

    /// Advances the exchange one round.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on mechanism failure, an empty
    /// authenticated identity, or too many rounds.
    pub fn step(&mut self, input: Option<&[u8]>) -> Result<SessionStep> {
        self.rounds += 1;
        if self.rounds > MAX_SASL_ROUNDS {
            return Err(Error::Auth(format!(
                "exchange exceeded {MAX_SASL_ROUNDS} rounds"
            )));
        }
        match self.mechanism.step(input)? {
            Step::Continue(out) => Ok(SessionStep::Continue(out)),
            Step::Done {
                identity,
                keys,
                output,
            } => {
                if identity.is_empty() {
                    return Err(Error::Auth("mechanism yielded empty identity".to_string()));
                }
                self.identity = Some(identity);
                self.keys = keys;
                Ok(SessionStep::Done { output })
            }
        }
    }

    /// The validated identity, once the exchange is complete.
    #[must_use]
    pub fn authenticated_user(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// True if the mechanism yielded key material for a protection
    /// layer.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Builds the per-channel protection state for this session.
    ///
    /// Identity pass-through when the mechanism negotiated no layer or
    /// the protocol version predates it.
    #[must_use]
    pub fn channel_security(&self, role: Role, version: ProtocolVersion) -> ChannelSecurity {
        match (&self.keys, version.supports_layer()) {
            (Some(keys), true) => ChannelSecurity::integrity(keys, role),
            _ => ChannelSecurity::identity(),
        }
    }
}

// =============================================================================
// Channel Security
// =============================================================================

/// Seal/open state for both channels of one session, direction-aware.
#[derive(Debug)]
pub struct ChannelSecurity {
    /// Outbound control lines.
    pub control_tx: Sealer,
    /// Inbound control lines.
    pub control_rx: Opener,
    /// Outbound data bytes.
    pub data_tx: Sealer,
    /// Inbound data bytes.
    pub data_rx: Opener,
}

impl ChannelSecurity {
    /// Pass-through on every channel.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            control_tx: Sealer::Identity,
            control_rx: Opener::identity(),
            data_tx: Sealer::Identity,
            data_rx: Opener::identity(),
        }
    }

    /// Keyed protection, with the key assignment flipped by role so
    /// each sealer pairs with the peer's matching opener.
    #[must_use]
    pub fn integrity(keys: &SessionKeys, role: Role) -> Self {
        match role {
            Role::Client => Self {
                control_tx: Sealer::integrity(keys.c2s_control),
                control_rx: Opener::integrity(keys.s2c_control),
                data_tx: Sealer::integrity(keys.c2s_data),
                data_rx: Opener::integrity(keys.s2c_data),
            },
            Role::Server => Self {
                control_tx: Sealer::integrity(keys.s2c_control),
                control_rx: Opener::integrity(keys.c2s_control),
                data_tx: Sealer::integrity(keys.s2c_data),
                data_rx: Opener::integrity(keys.c2s_data),
            },
        }
    }

    /// True if every channel is pass-through.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.control_tx.is_identity()
    }
}
