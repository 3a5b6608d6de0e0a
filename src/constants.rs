//! Constants for the ARC protocol engine.
//!
//! All limits, timeouts, and defaults are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum control line length on the wire (bytes, CRLF included).
/// Bounds memory per connection and rejects runaway peers early.
pub const MAX_LINE_LEN: usize = 65536;

/// Maximum command name length in a `CMD` request.
pub const MAX_COMMAND_NAME_LEN: usize = 64;

/// Maximum total argument length in a `CMD` request (bytes).
pub const MAX_COMMAND_ARG_LEN: usize = 4096;

/// Maximum SASL token size after base64 decoding (bytes).
pub const MAX_SASL_TOKEN_LEN: usize = 8192;

/// Maximum number of SASL rounds before the exchange is abandoned.
/// No shipped mechanism needs more than three.
pub const MAX_SASL_ROUNDS: usize = 8;

// =============================================================================
// Security Layer
// =============================================================================

/// Maximum payload bytes per integrity-layer frame.
///
/// Wrapped streams are chunked at this boundary; the receiving side
/// reassembles frames of any size up to this limit.
pub const MAX_WRAP_CHUNK: usize = 32 * 1024;

/// Integrity tag length (HMAC-SHA256).
pub const WRAP_TAG_LEN: usize = 32;

/// SCRAM PBKDF2 iteration count offered by the server.
pub const SCRAM_ITERATIONS: u32 = 4096;

/// SCRAM nonce length (bytes, before base64).
pub const SCRAM_NONCE_LEN: usize = 18;

/// SCRAM salt length (bytes).
pub const SCRAM_SALT_LEN: usize = 16;

// =============================================================================
// Timeouts
// =============================================================================

/// Default timeout for every blocking read/write on either channel.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL for a spawned command.
pub const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Parent supervision tick for the prefork pool.
pub const POOL_TICK: Duration = Duration::from_secs(1);

// =============================================================================
// Network Defaults
// =============================================================================

/// Default control port for arcxd.
pub const DEFAULT_PORT: u16 = 4242;

/// Default listen address for arcxd.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Relay copy buffer size (bytes).
pub const RELAY_BUF_LEN: usize = 16 * 1024;

// =============================================================================
// Pool Defaults
// =============================================================================

/// Default minimum pool size.
pub const DEFAULT_MIN_SERVERS: usize = 2;

/// Default maximum pool size.
pub const DEFAULT_MAX_SERVERS: usize = 8;

/// Default minimum idle workers.
pub const DEFAULT_MIN_SPARE: usize = 1;

/// Default maximum idle workers.
pub const DEFAULT_MAX_SPARE: usize = 4;

/// Default connections served per worker before it is replaced.
pub const DEFAULT_MAX_REQUESTS: usize = 100;

// =============================================================================
// Service Defaults
// =============================================================================

/// Default SASL service name.
pub const DEFAULT_SERVICE: &str = "arcx";

/// Default mechanism preference list (server side).
pub const DEFAULT_MECHANISMS: &str = "SCRAM-SHA-256,PLAIN";

/// Identity reported before authentication completes.
/// Never consulted for authorization.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";
