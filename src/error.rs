//! Error types for the ARC protocol engine.

/// Result type alias for ARC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ARC protocol engine.
///
/// Variants map one-to-one onto the failure surfaces of the protocol:
/// startup failures (`Config`, `Bind`), connection-fatal failures
/// (`Protocol`, `Auth`, `Timeout`, `PeerClosed`, `ChildSpawn`,
/// `Internal`, `Io`), and the one in-session recoverable failure
/// (`NotAuthorized`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Startup Errors
    // =========================================================================
    /// Configuration key missing, unreadable, or malformed.
    #[error("config error in [{section}] {key}: {reason}")]
    Config {
        section: String,
        key: String,
        reason: String,
    },

    /// Configuration file could not be read at all.
    #[error("cannot read config {path}: {reason}")]
    ConfigRead { path: String, reason: String },

    /// Cannot listen on a configured address.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    // =========================================================================
    // Connection-Fatal Errors
    // =========================================================================
    /// Unexpected verb, malformed line, or base64 failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SASL negotiation failure, empty identity, or unsupported mechanism.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A blocking read/write exceeded the connection timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The peer closed the connection mid-operation.
    #[error("peer closed connection: {0}")]
    PeerClosed(String),

    /// The configured command could not be spawned.
    #[error("failed to spawn command '{command}': {reason}")]
    ChildSpawn { command: String, reason: String },

    /// Unexpected I/O or resource exhaustion.
    #[error("internal error: {0}")]
    Internal(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // In-Session Recoverable Errors
    // =========================================================================
    /// The ACL denies this command for the authenticated user.
    /// The session returns to the authenticated idle state.
    #[error("not authorized: {user} may not run '{command}'")]
    NotAuthorized { user: String, command: String },
}

impl Error {
    /// True if the session can continue after this error.
    ///
    /// Only authorization denials are recoverable; everything else
    /// tears the connection down.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotAuthorized { .. })
    }

    /// The short reason string sent to the peer in an `ERR` line.
    ///
    /// Authentication detail stays server-side; the peer only learns
    /// that authentication failed.
    #[must_use]
    pub fn wire_reason(&self) -> String {
        match self {
            Self::Protocol(msg) => format!("protocol error: {msg}"),
            Self::Auth(_) => "authentication failed".to_string(),
            Self::NotAuthorized { command, .. } => {
                format!("not authorized for '{command}'")
            }
            Self::ChildSpawn { command, .. } => {
                format!("cannot start '{command}'")
            }
            Self::Timeout(_) => "timeout".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

// =============================================================================
// Latched Error Carrier
// =============================================================================

/// At most one latched error string per connection.
///
/// Internals return [`Result`] everywhere; the latch exists only as the
/// connection-level façade so callers that poll state after the fact
/// (the CLI, tests) can read what went wrong first. Latching again
/// prepends, so the outermost context reads left to right.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    latched: Option<String>,
}

impl ErrorLatch {
    /// Creates an empty latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches `msg`, prepending it to any existing error, and logs
    /// the combined string at the ERR facility.
    pub fn latch(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        let combined = match self.latched.take() {
            Some(prev) => format!("{msg}: {prev}"),
            None => msg,
        };
        tracing::error!(facility = "ERR", "{combined}");
        self.latched = Some(combined);
    }

    /// Returns the latched string, if any.
    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.latched.as_deref()
    }

    /// True if an error has been latched.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.latched.is_some()
    }

    /// Clears the latch at the start of a new logical operation.
    pub fn clear(&mut self) {
        self.latched = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_prepends() {
        let mut latch = ErrorLatch::new();
        latch.latch("read failed");
        latch.latch("handshake");
        assert_eq!(latch.get(), Some("handshake: read failed"));
    }

    #[test]
    fn test_latch_clear() {
        let mut latch = ErrorLatch::new();
        latch.latch("boom");
        assert!(latch.is_set());
        latch.clear();
        assert!(!latch.is_set());
        assert_eq!(latch.get(), None);
    }

    #[test]
    fn test_recoverable_classification() {
        let denied = Error::NotAuthorized {
            user: "alice".to_string(),
            command: "reboot".to_string(),
        };
        assert!(denied.is_recoverable());

        let proto = Error::Protocol("bad verb".to_string());
        assert!(!proto.is_recoverable());
    }

    #[test]
    fn test_wire_reason_hides_detail() {
        let auth = Error::Auth("bad password for alice".to_string());
        assert_eq!(auth.wire_reason(), "authentication failed");

        let denied = Error::NotAuthorized {
            user: "alice".to_string(),
            command: "reboot".to_string(),
        };
        assert!(denied.wire_reason().contains("reboot"));
        assert!(!denied.wire_reason().contains("alice"));
    }
}
