//! Bounded scratch buffer for one receive or one input line.
//!
//! The wire protocol works in fixed-size chunks: each loop iteration reads
//! into the same buffer, treats the bytes as one message, and discards them.
//! Reads are capped at capacity−1 so there is always room to treat the
//! contents as a terminated string, and the suffix append is bounded with
//! truncate-and-report semantics rather than growing the buffer.

use std::io::{self, Read};

/// Default buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 512;

/// Fixed-capacity line buffer.
///
/// Holds at most `capacity - 1` bytes of content; the reserved byte keeps
/// the bounded-append arithmetic identical to a NUL-terminated string of the
/// same capacity.
pub struct LineBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl LineBuffer {
    /// Create a buffer with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity < 2` (no room for both content and terminator).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "buffer capacity must be at least 2");
        Self {
            buf: vec![0u8; capacity],
            len: 0,
        }
    }

    /// The content bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The content as text, with invalid UTF-8 replaced for display.
    pub fn display(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    /// Replace the contents with one read from `source`, capped at
    /// capacity−1 bytes. Returns the number of bytes read; zero means the
    /// source reached end-of-stream.
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        let cap = self.buf.len() - 1;
        let n = source.read(&mut self.buf[..cap])?;
        self.len = n;
        Ok(n)
    }

    /// Truncate the content at the first CR or LF, discarding everything
    /// from that character onward.
    pub fn truncate_at_line_break(&mut self) {
        if let Some(pos) = self.buf[..self.len]
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
        {
            self.len = pos;
        }
    }

    /// Append `suffix`, truncating at capacity−1 content bytes.
    ///
    /// Returns the length the content would have had with unlimited space,
    /// whether or not it fit, so callers can detect truncation.
    pub fn append_bounded(&mut self, suffix: &[u8]) -> usize {
        let would_be = self.len + suffix.len();
        let cap = self.buf.len() - 1;
        let room = cap.saturating_sub(self.len);
        let take = suffix.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&suffix[..take]);
        self.len += take;
        would_be
    }
}
