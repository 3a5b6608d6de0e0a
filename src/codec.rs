//! CRLF line codec for the control channel.
//!
//! A single reader owns the socket. Reads land in an internal buffer;
//! complete lines are split off into a queue and handed out one per
//! call, with the incomplete tail retained for the next read. This
//! replaces a plain `BufReader` because post-authentication lines must
//! pass through base64 and the SASL layer before they mean anything;
//! the codec deals only in raw framed lines.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::constants::MAX_LINE_LEN;
use crate::error::{Error, Result};

/// Line-oriented framing over the control socket.
#[derive(Debug)]
pub struct LineCodec {
    stream: TcpStream,
    partial: Vec<u8>,
    queue: VecDeque<Vec<u8>>,
    timeout: Duration,
}

impl LineCodec {
    /// Wraps a connected stream.
    #[must_use]
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        Self {
            stream,
            partial: Vec::new(),
            queue: VecDeque::new(),
            timeout,
        }
    }

    /// The configured per-call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Local address of the control socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is no longer usable.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Peer address of the control socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is no longer usable.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Returns the next complete line, without its CRLF terminator.
    ///
    /// Blocks up to the configured timeout for a full line to arrive.
    /// `Ok(None)` is clean end-of-stream: the peer closed with no
    /// partial line pending.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no full line arrives within the window.
    /// - [`Error::PeerClosed`] on EOF with a partial line buffered.
    /// - [`Error::Protocol`] on an over-long or non-UTF-8 line.
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(line) = self.queue.pop_front() {
                let line = String::from_utf8(line)
                    .map_err(|_| Error::Protocol("line is not valid UTF-8".to_string()))?;
                return Ok(Some(line));
            }

            let mut buf = [0u8; 4096];
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout(self.timeout))??;

            if read == 0 {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                return Err(Error::PeerClosed(format!(
                    "{} bytes of partial line pending",
                    self.partial.len()
                )));
            }

            self.partial.extend_from_slice(&buf[..read]);
            self.split_completed_lines()?;
        }
    }

    /// Writes one line, appending CRLF, as a single write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the write does not complete within
    /// the window, or the underlying I/O error.
    pub async fn send_line(&mut self, line: &[u8]) -> Result<()> {
        if line.len() + 2 > MAX_LINE_LEN {
            return Err(Error::Protocol(format!(
                "outgoing line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        let mut framed = Vec::with_capacity(line.len() + 2);
        framed.extend_from_slice(line);
        framed.extend_from_slice(b"\r\n");

        tokio::time::timeout(self.timeout, async {
            self.stream.write_all(&framed).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;
        Ok(())
    }

    /// Moves every complete line from `partial` into the queue.
    ///
    /// Accepts bare LF from peers that skip the CR; the terminator is
    /// stripped either way.
    fn split_completed_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.queue.push_back(line);
        }
        if self.partial.len() > MAX_LINE_LEN {
            return Err(Error::Protocol(format!(
                "control line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Gracefully shuts down the write half.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
