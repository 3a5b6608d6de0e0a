//! Facility-filtered logging on top of `tracing`.
//!
//! The daemon filters by a facility bitmask, not by tracing level: each
//! log call names the facility it belongs to, and the configured mask
//! decides whether the event is emitted at all. Facilities map onto
//! tracing levels only for rendering (ERR is an error event, DEBUG a
//! debug event, everything else info).
//!
//! The core only produces structured events; sink selection (stderr or
//! syslog) happens once in the binaries via [`init_stderr`] /
//! [`init_syslog`].

use std::fmt;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;

use tracing_subscriber::fmt::MakeWriter;

// =============================================================================
// Facilities
// =============================================================================

/// Log facility bits.
pub mod facility {
    /// Authentication events (handshake outcome, identity).
    pub const AUTH: u32 = 1;
    /// User-visible session events (connect, quit).
    pub const USER: u32 = 2;
    /// Errors. Always rendered as `tracing::error!`.
    pub const ERR: u32 = 4;
    /// Command dispatch (request, exit status).
    pub const CMD: u32 = 8;
    /// Data side-channel events (open, close, byte counts).
    pub const SIDE: u32 = 16;
    /// Wire-level debugging.
    pub const DEBUG: u32 = 32;
}

/// Configured facility bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMask(pub u32);

impl LogMask {
    /// The daemon default: AUTH, USER, ERR and CMD.
    pub const DEFAULT: Self = Self(facility::AUTH | facility::USER | facility::ERR | facility::CMD);

    /// True if any of `bits` is enabled in this mask.
    #[must_use]
    pub fn enabled(self, bits: u32) -> bool {
        self.0 & bits != 0
    }
}

impl Default for LogMask {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Renders a facility bitmask as its dominant name for event fields.
fn facility_name(bits: u32) -> &'static str {
    if bits & facility::ERR != 0 {
        "ERR"
    } else if bits & facility::AUTH != 0 {
        "AUTH"
    } else if bits & facility::CMD != 0 {
        "CMD"
    } else if bits & facility::SIDE != 0 {
        "SIDE"
    } else if bits & facility::DEBUG != 0 {
        "DEBUG"
    } else {
        "USER"
    }
}

/// Emits one event at `bits` iff the mask enables it.
///
/// ERR events are always emitted regardless of the mask, so failures
/// cannot be configured away.
pub fn emit(mask: LogMask, bits: u32, args: fmt::Arguments<'_>) {
    if bits & facility::ERR != 0 {
        tracing::error!(facility = facility_name(bits), "{args}");
        return;
    }
    if !mask.enabled(bits) {
        return;
    }
    if bits & facility::DEBUG != 0 {
        tracing::debug!(facility = facility_name(bits), "{args}");
    } else {
        tracing::info!(facility = facility_name(bits), "{args}");
    }
}

/// Facility-filtered logging. `arc_log!(mask, facility::CMD, "ran {}", name)`.
#[macro_export]
macro_rules! arc_log {
    ($mask:expr, $bits:expr, $($arg:tt)*) => {
        $crate::log::emit($mask, $bits, format_args!($($arg)*))
    };
}

// =============================================================================
// Sinks
// =============================================================================

/// Installs the stderr sink (compact, no ANSI, debug events enabled).
///
/// Returns false if a global subscriber was already installed, which in
/// tests is normal and harmless.
pub fn init_stderr() -> bool {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_ansi(false)
        .with_writer(io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Installs the syslog sink.
///
/// # Errors
///
/// Returns an error if the syslog socket cannot be opened.
pub fn init_syslog(ident: &str) -> io::Result<bool> {
    let writer = SyslogWriter::connect(ident)?;
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_ansi(false)
        .without_time()
        .with_writer(writer)
        .compact()
        .finish();
    Ok(tracing::subscriber::set_global_default(subscriber).is_ok())
}

// =============================================================================
// Syslog Writer
// =============================================================================

/// Minimal RFC 3164 writer over the `/dev/log` datagram socket.
///
/// Each formatted record becomes exactly one datagram, which keeps log
/// writes line-atomic even with many workers sharing the sink.
pub struct SyslogWriter {
    socket: Mutex<UnixDatagram>,
    ident: String,
}

/// daemon facility (3) << 3 | info severity (6).
const SYSLOG_PRI_INFO: u8 = 3 << 3 | 6;

impl SyslogWriter {
    /// Connects to the local syslog socket.
    ///
    /// # Errors
    ///
    /// Returns an error if neither `/dev/log` nor `/var/run/syslog`
    /// (macOS) accepts the connection.
    pub fn connect(ident: &str) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket
            .connect("/dev/log")
            .or_else(|_| socket.connect("/var/run/syslog"))?;
        Ok(Self {
            socket: Mutex::new(socket),
            ident: ident.to_string(),
        })
    }
}

impl io::Write for &SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let body = String::from_utf8_lossy(buf);
        let body = body.trim_end_matches(['\r', '\n']);
        let record = format!(
            "<{}>{}[{}]: {}",
            SYSLOG_PRI_INFO,
            self.ident,
            std::process::id(),
            body
        );
        let socket = self
            .socket
            .lock()
            .map_err(|_| io::Error::other("syslog socket poisoned"))?;
        socket.send(record.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SyslogWriter {
    type Writer = &'a SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_enabled() {
        let mask = LogMask(facility::AUTH | facility::ERR);
        assert!(mask.enabled(facility::AUTH));
        assert!(mask.enabled(facility::ERR));
        assert!(!mask.enabled(facility::CMD));
        assert!(mask.enabled(facility::AUTH | facility::CMD));
    }

    #[test]
    fn test_default_mask() {
        let mask = LogMask::default();
        assert!(mask.enabled(facility::AUTH));
        assert!(mask.enabled(facility::USER));
        assert!(mask.enabled(facility::ERR));
        assert!(mask.enabled(facility::CMD));
        assert!(!mask.enabled(facility::SIDE));
        assert!(!mask.enabled(facility::DEBUG));
    }

    #[test]
    fn test_facility_name_dominance() {
        assert_eq!(facility_name(facility::ERR | facility::CMD), "ERR");
        assert_eq!(facility_name(facility::CMD), "CMD");
        assert_eq!(facility_name(facility::SIDE), "SIDE");
        assert_eq!(facility_name(facility::USER), "USER");
    }
}
