//! PLAIN mechanism (RFC 4616).
//!
//! One round: the client sends `authzid NUL authcid NUL passwd`, the
//! server verifies the password against its secret store. PLAIN never
//! negotiates a protection layer.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sasl::{Mechanism, SecretStore, Step};

pub const MECH_NAME: &str = "PLAIN";

/// Constant-time byte equality.
///
/// Secrets are compared without short-circuiting so timing does not
/// leak the matching prefix length.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// =============================================================================
// Client
// =============================================================================

/// Client side of PLAIN.
#[derive(Debug)]
pub struct PlainClient {
    user: String,
    secret: String,
    sent: bool,
}

impl PlainClient {
    #[must_use]
    pub fn new(user: &str, secret: &str) -> Self {
        Self {
            user: user.to_string(),
            secret: secret.to_string(),
            sent: false,
        }
    }
}

impl Mechanism for PlainClient {
    fn name(&self) -> &'static str {
        MECH_NAME
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<Step> {
        if !self.sent {
            self.sent = true;
            let mut token = Vec::new();
            token.push(0);
            token.extend_from_slice(self.user.as_bytes());
            token.push(0);
            token.extend_from_slice(self.secret.as_bytes());
            return Ok(Step::Continue(token));
        }

        // Completion: the server's OK carries no payload for PLAIN.
        if input.is_some_and(|t| !t.is_empty()) {
            return Err(Error::Auth(
                "unexpected server payload for PLAIN".to_string(),
            ));
        }
        Ok(Step::Done {
            identity: self.user.clone(),
            keys: None,
            output: None,
        })
    }
}

// =============================================================================
// Server
// =============================================================================

/// Server side of PLAIN, verifying against a [`SecretStore`].
pub struct PlainServer {
    store: Arc<dyn SecretStore>,
}

impl PlainServer {
    #[must_use]
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }
}

impl Mechanism for PlainServer {
    fn name(&self) -> &'static str {
        MECH_NAME
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<Step> {
        let token = input.ok_or_else(|| Error::Auth("PLAIN needs an initial token".to_string()))?;

        let mut parts = token.splitn(3, |&b| b == 0);
        let authzid = parts.next().unwrap_or_default();
        let authcid = parts
            .next()
            .ok_or_else(|| Error::Auth("malformed PLAIN token".to_string()))?;
        let passwd = parts
            .next()
            .ok_or_else(|| Error::Auth("malformed PLAIN token".to_string()))?;

        let authcid = std::str::from_utf8(authcid)
            .map_err(|_| Error::Auth("authcid is not valid UTF-8".to_string()))?;
        if authcid.is_empty() {
            return Err(Error::Auth("empty authentication identity".to_string()));
        }
        // Proxy authorization is not supported: authzid must be absent
        // or identical to authcid.
        if !authzid.is_empty() && authzid != authcid.as_bytes() {
            return Err(Error::Auth("authzid does not match authcid".to_string()));
        }

        let expected = self
            .store
            .lookup(authcid)
            .ok_or_else(|| Error::Auth(format!("unknown user '{authcid}'")))?;
        if !ct_eq(expected.as_bytes(), passwd) {
            return Err(Error::Auth(format!("bad password for '{authcid}'")));
        }

        Ok(Step::Done {
            identity: authcid.to_string(),
            keys: None,
            output: None,
        })
    }
}
