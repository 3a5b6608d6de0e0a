//! # arcx
//!
//! **Authenticated Remote Command execution (ARC)**
//!
//! This crate lets unprivileged clients request the execution of a
//! fixed, server-configured set of privileged commands on a server
//! host. The server performs strong mutual authentication (SASL),
//! enforces a per-user/per-command access policy, spawns the command
//! under its own credentials, and relays the command's stdio to the
//! client over an encrypted secondary channel. All privilege stays
//! server-side; the client host is assumed to be the less trusted
//! party.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ arcxd (parent, sync)                                             │
//! │   prefork pool ── fork ──► worker (tokio, current-thread)        │
//! │                              │ accept                            │
//! │                              ▼                                   │
//! │   ┌──────────────────────────────────────────────────────────┐   │
//! │   │ control channel (TCP, CRLF lines)                        │   │
//! │   │   AUTH → SASL… → OK        handshake (PLAIN / SCRAM)     │   │
//! │   │   CMD name args            table lookup + ACL check      │   │
//! │   │   CMDPASV host:port        data-channel rendezvous       │   │
//! │   │   EXIT status              child exit propagation        │   │
//! │   └──────────────────────────────────────────────────────────┘   │
//! │                              │                                   │
//! │   ┌──────────────────────────▼───────────────────────────────┐   │
//! │   │ data channel (TCP, sealed bytes)                         │   │
//! │   │   child stdin/stdout+stderr ⇄ client stdin/stdout        │   │
//! │   └──────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Two versions are spoken, negotiated in the `AUTH` exchange:
//!
//! | Version   | `CMDPORT` | Integrity layer        |
//! |-----------|-----------|------------------------|
//! | `ARC/2.0` | no        | never                  |
//! | `ARC/2.1` | yes       | when keys negotiated   |
//!
//! After authentication every control line is SASL-wrapped and
//! base64-encoded; the data channel carries wrapped bytes raw. With
//! SCRAM-SHA-256 on an ARC/2.1 session, "wrapped" means HMAC-framed
//! with per-direction sequence numbers (see [`sasl`]); with PLAIN it
//! is identity pass-through.
//!
//! # Security Model
//!
//! - **Authentication before anything**: the expected-next verb gate
//!   makes a pre-auth `CMD` a protocol violation, and the dispatcher
//!   re-checks before spawning.
//! - **Fail-closed authorization**: a command without an `[acl]` entry
//!   is denied for everyone; denials leave the session usable.
//! - **No shell, ever**: command templates and client arguments become
//!   separate argv entries of a directly spawned executable.
//! - **Bounded everything**: line length, SASL token size and round
//!   count, command name/argument sizes, and one timeout over every
//!   blocking read, write, accept, and wait.
//! - **Worker hygiene**: each connection is served by a preforked
//!   worker process; workers retire after `max_requests` connections.
//!
//! # Example
//!
//! ```rust,ignore
//! use arcx::client::{ClientOptions, ClientSession};
//!
//! #[tokio::main]
//! async fn main() -> arcx::Result<()> {
//!     let options = ClientOptions::new("alice", "pencil");
//!     let mut session =
//!         ClientSession::connect("198.51.100.7:4242".parse().unwrap(), options).await?;
//!
//!     let status = session
//!         .run("echo", &["hello".into()], tokio::io::stdin(), tokio::io::stdout())
//!         .await?;
//!     session.quit().await?;
//!     std::process::exit(status);
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod acl;
pub mod client;
pub mod codec;
pub mod config;
pub mod conn;
pub mod constants;
pub mod data;
pub mod error;
pub mod log;
pub mod pidfile;
pub mod pool;
pub mod protocol;
pub mod sasl;
pub mod server;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use protocol::{ProtocolVersion, Role, Verb};
