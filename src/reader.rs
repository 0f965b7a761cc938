//! Framed byte reader: reads from an async source into a growable buffer and
//! yields one complete JSON-RPC message at a time, split on the `\n\n`
//! boundary used by both the node-stdin and RPC-socket channels.
//!
//! The growable-buffer-plus-boundary-scan shape mirrors the sync chunked line
//! reader in the pack (`wrapper_events::reader::sync::SyncBoundedLineReader`):
//! fill a fixed-size chunk, scan the filled region for the delimiter, and only
//! grow the backing buffer when a message does not fit in what is already
//! held. Unlike that reader we frame on `\n\n`, not `\n`, and the boundary can
//! span more than one read.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::PluginError;

const INITIAL_CAPACITY: usize = 8 * 1024;
const BOUNDARY: &[u8] = b"\n\n";

/// Reads framed JSON-RPC messages from `R`, one complete top-level object at
/// a time.
pub struct FramedReader<R> {
    reader: R,
    buf: Vec<u8>,
    filled: usize,
    channel: &'static str,
}

/// Outcome of a single read-and-frame attempt.
pub enum Framed {
    /// A complete message, with the trailing `\n\n` already stripped.
    Message(Vec<u8>),
    /// The peer closed the connection cleanly with no partial message
    /// pending. Callers treat this as a terminal, non-error signal.
    Eof,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R, channel: &'static str) -> Self {
        Self {
            reader,
            buf: vec![0u8; INITIAL_CAPACITY],
            filled: 0,
            channel,
        }
    }

    /// Reads until one complete framed message is available, or the peer
    /// disconnects.
    ///
    /// A message already buffered from a previous read is returned before any
    /// further I/O occurs, so callers can drain a backlog without waiting on
    /// readiness (this is what lets the event loop's step 2 in §4.7 "process
    /// exactly one reply and continue" be non-blocking when one is already
    /// queued).
    pub async fn next_message(&mut self) -> Result<Framed, PluginError> {
        loop {
            if let Some(msg) = self.take_buffered_message() {
                return Ok(Framed::Message(msg));
            }

            if self.filled == self.buf.len() {
                self.grow();
            }

            let n = self
                .reader
                .read(&mut self.buf[self.filled..])
                .await
                .map_err(|source| PluginError::io(self.channel, source))?;

            if n == 0 {
                return if self.filled == 0 {
                    Ok(Framed::Eof)
                } else {
                    Err(PluginError::Protocol(format!(
                        "{} closed with a partial message pending ({} bytes)",
                        self.channel, self.filled
                    )))
                };
            }

            self.filled += n;
        }
    }

    /// Non-blocking variant of [`Self::next_message`]: returns a message
    /// already sitting in the buffer without touching the underlying source.
    /// Used by the event loop's opportunistic reply-backlog drain (§4.7 step
    /// 2) so a queue of already-received RPC replies never waits on I/O
    /// readiness.
    pub(crate) fn try_take_message(&mut self) -> Option<Vec<u8>> {
        self.take_buffered_message()
    }

    /// Returns and removes the first complete message in the buffer, if any,
    /// shifting any remaining bytes down to the front.
    fn take_buffered_message(&mut self) -> Option<Vec<u8>> {
        let filled = &self.buf[..self.filled];
        let boundary_at = find_subslice(filled, BOUNDARY)?;

        let message = filled[..boundary_at].to_vec();
        let consumed = boundary_at + BOUNDARY.len();
        let remaining = self.filled - consumed;
        self.buf.copy_within(consumed..self.filled, 0);
        self.filled = remaining;

        Some(message)
    }

    fn grow(&mut self) {
        let new_len = self.buf.len() * 2;
        self.buf.resize(new_len, 0);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
