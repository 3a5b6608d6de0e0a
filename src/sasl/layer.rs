//! Per-message integrity layer for authenticated sessions.
//!
//! When a mechanism yields session keys and the negotiated protocol
//! version admits it, every byte written after authentication passes
//! through [`Sealer::seal`] and every byte read passes through
//! [`Opener`]. Each direction of each channel has its own key and its
//! own 64-bit sequence number, so frames cannot be replayed, reordered,
//! or reflected across channels.
//!
//! # Frame Format
//!
//! ```text
//! +-------------+-----------------+------------------------------+
//! | len: u32 BE | payload (≤32 K) | tag: HMAC-SHA256(key, seq‖payload) |
//! +-------------+-----------------+------------------------------+
//! ```
//!
//! Payloads longer than [`MAX_WRAP_CHUNK`] are split across frames;
//! the opener reassembles transparently. Control lines base64-encode
//! the sealed bytes to stay line-safe; the data channel carries them
//! raw.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constants::{MAX_WRAP_CHUNK, WRAP_TAG_LEN};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const FRAME_HEADER_LEN: usize = 4;

// =============================================================================
// Session Keys
// =============================================================================

/// Direction- and channel-separated keys derived by a mechanism on
/// completion.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Client-to-server control lines.
    pub c2s_control: [u8; 32],
    /// Server-to-client control lines.
    pub s2c_control: [u8; 32],
    /// Client-to-server data bytes.
    pub c2s_data: [u8; 32],
    /// Server-to-client data bytes.
    pub s2c_data: [u8; 32],
}

// =============================================================================
// Sealer
// =============================================================================

/// Outbound half of the layer: identity pass-through or keyed framing.
#[derive(Debug)]
pub enum Sealer {
    /// No protection layer negotiated; bytes pass unchanged.
    Identity,
    /// Keyed integrity framing.
    Integrity(IntegritySealer),
}

impl Sealer {
    /// A keyed sealer starting at sequence number zero.
    #[must_use]
    pub fn integrity(key: [u8; 32]) -> Self {
        Self::Integrity(IntegritySealer { key, seq: 0 })
    }

    /// True if this sealer passes bytes through unchanged.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Wraps `payload` for the wire.
    #[must_use]
    pub fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        match self {
            Self::Identity => payload.to_vec(),
            Self::Integrity(inner) => inner.seal(payload),
        }
    }
}

/// Keyed sealing state for one direction of one channel.
#[derive(Debug)]
pub struct IntegritySealer {
    key: [u8; 32],
    seq: u64,
}

impl IntegritySealer {
    fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN + WRAP_TAG_LEN);
        // An empty payload still produces one frame so EOF-adjacent
        // writes keep the sequence numbers aligned on both sides.
        let mut chunks = payload.chunks(MAX_WRAP_CHUNK);
        let first = chunks.next().unwrap_or(&[]);
        self.seal_chunk(first, &mut out);
        for chunk in chunks {
            self.seal_chunk(chunk, &mut out);
        }
        out
    }

    fn seal_chunk(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(&self.seq.to_be_bytes());
        mac.update(chunk);
        let tag = mac.finalize().into_bytes();

        out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(&tag);
        self.seq += 1;
    }
}

// =============================================================================
// Opener
// =============================================================================

/// Inbound half of the layer: identity pass-through or verifying
/// reassembly. Stateful: partial frames are buffered across calls.
#[derive(Debug)]
pub enum Opener {
    /// No protection layer negotiated; bytes pass unchanged.
    Identity { buf: Vec<u8> },
    /// Keyed integrity verification.
    Integrity(IntegrityOpener),
}

impl Opener {
    /// An identity opener.
    #[must_use]
    pub fn identity() -> Self {
        Self::Identity { buf: Vec::new() }
    }

    /// A keyed opener starting at sequence number zero.
    #[must_use]
    pub fn integrity(key: [u8; 32]) -> Self {
        Self::Integrity(IntegrityOpener {
            key,
            seq: 0,
            buf: Vec::new(),
        })
    }

    /// Feeds wire bytes into the reassembly buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        match self {
            Self::Identity { buf } => buf.extend_from_slice(bytes),
            Self::Integrity(inner) => inner.buf.extend_from_slice(bytes),
        }
    }

    /// Returns all plaintext whose frames have fully arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on a bad tag, an out-of-bounds frame
    /// length, or a sequence violation. Layer errors are not
    /// recoverable; the connection must be torn down.
    pub fn drain(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Identity { buf } => Ok(std::mem::take(buf)),
            Self::Integrity(inner) => inner.drain(),
        }
    }

    /// Opens one self-contained wire message (a control line).
    ///
    /// # Errors
    ///
    /// As [`Opener::drain`], plus [`Error::Protocol`] if the message
    /// ends mid-frame; control lines must carry whole frames.
    pub fn open(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.push(bytes);
        let plain = self.drain()?;
        let pending = match self {
            Self::Identity { buf } => buf.len(),
            Self::Integrity(inner) => inner.buf.len(),
        };
        if pending != 0 {
            return Err(Error::Protocol(
                "control line ends inside a sealed frame".to_string(),
            ));
        }
        Ok(plain)
    }
}

/// Keyed opening state for one direction of one channel.
#[derive(Debug)]
pub struct IntegrityOpener {
    key: [u8; 32],
    seq: u64,
    buf: Vec<u8>,
}

impl IntegrityOpener {
    fn drain(&mut self) -> Result<Vec<u8>> {
        let mut plain = Vec::new();
        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                return Ok(plain);
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_WRAP_CHUNK {
                return Err(Error::Protocol(format!(
                    "sealed frame length {len} exceeds {MAX_WRAP_CHUNK}"
                )));
            }
            let frame_len = FRAME_HEADER_LEN + len + WRAP_TAG_LEN;
            if self.buf.len() < frame_len {
                return Ok(plain);
            }

            let payload = &self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
            let tag = &self.buf[FRAME_HEADER_LEN + len..frame_len];

            let mut mac =
                HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
            mac.update(&self.seq.to_be_bytes());
            mac.update(payload);
            mac.verify_slice(tag)
                .map_err(|_| Error::Protocol("sealed frame failed integrity check".to_string()))?;

            plain.extend_from_slice(payload);
            self.seq += 1;
            self.buf.drain(..frame_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_identity_round_trip() {
        let mut sealer = Sealer::Identity;
        let mut opener = Opener::identity();
        let sealed = sealer.seal(b"hello");
        assert_eq!(sealed, b"hello");
        assert_eq!(opener.open(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_integrity_round_trip() {
        let mut sealer = Sealer::integrity(KEY);
        let mut opener = Opener::integrity(KEY);
        for msg in [&b"first"[..], b"", b"third message"] {
            let sealed = sealer.seal(msg);
            assert_ne!(sealed, msg);
            assert_eq!(opener.open(&sealed).unwrap(), msg);
        }
    }

    #[test]
    fn test_integrity_chunks_large_payloads() {
        let payload = vec![0xAB; MAX_WRAP_CHUNK * 2 + 17];
        let mut sealer = Sealer::integrity(KEY);
        let mut opener = Opener::integrity(KEY);
        let sealed = sealer.seal(&payload);
        assert_eq!(opener.open(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_partial_frames_buffer() {
        let mut sealer = Sealer::integrity(KEY);
        let mut opener = Opener::integrity(KEY);
        let sealed = sealer.seal(b"split across reads");

        let (a, b) = sealed.split_at(sealed.len() / 2);
        opener.push(a);
        assert_eq!(opener.drain().unwrap(), b"");
        opener.push(b);
        assert_eq!(opener.drain().unwrap(), b"split across reads");
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let mut sealer = Sealer::integrity(KEY);
        let mut opener = Opener::integrity(KEY);
        let mut sealed = sealer.seal(b"authentic");
        sealed[FRAME_HEADER_LEN] ^= 0x01;
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn test_replayed_frame_rejected() {
        let mut sealer = Sealer::integrity(KEY);
        let sealed = sealer.seal(b"once only");

        let mut opener = Opener::integrity(KEY);
        assert!(opener.open(&sealed).is_ok());
        // Same frame again: the opener expects sequence 1 now.
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut sealer = Sealer::integrity(KEY);
        let mut opener = Opener::integrity([9u8; 32]);
        let sealed = sealer.seal(b"secret");
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn test_cross_direction_frames_rejected() {
        // A frame sealed for one direction must not open in the other
        // even with the same key, once the sequences diverge.
        let mut tx = Sealer::integrity(KEY);
        let mut rx = Opener::integrity(KEY);
        let _ = tx.seal(b"advance tx seq");
        let sealed = tx.seal(b"second frame");
        assert!(rx.open(&sealed).is_err());
    }
}
