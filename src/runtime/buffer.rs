//! Per-connection staging queues.
//!
//! A `ByteQueue` stages bytes toward a target size (its "want"). The cursor
//! counts bytes already transferred: filled bytes for an inbound queue,
//! flushed bytes for an outbound one. Every transfer method performs exactly
//! one `read`/`write` call and never loops across `WouldBlock`; driving the
//! queue until it is satisfied is the connection's job.
//!
//! Inbound storage grows lazily, at most [`MAX_READ_CHUNK`] bytes per read,
//! so a large announced frame does not allocate its full size up front.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Upper bound on capacity staged for a single read attempt.
pub const MAX_READ_CHUNK: usize = 64 * 1024;

/// Growable staging buffer with a target fill size and a cursor.
#[derive(Debug, Default)]
pub struct ByteQueue {
    /// Backing storage. May extend past `cursor` with scratch space.
    buf: BytesMut,
    /// Bytes transferred so far.
    cursor: usize,
    /// Target number of bytes.
    want: usize,
}

impl ByteQueue {
    /// Create an inbound queue that wants `want` bytes.
    pub fn new(want: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(want.min(MAX_READ_CHUNK)),
            cursor: 0,
            want,
        }
    }

    /// Create an outbound queue holding `data` to be written.
    pub fn outbound(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            cursor: 0,
            want: data.len(),
        }
    }

    /// True while fewer than `want` bytes have been transferred.
    pub fn hungry(&self) -> bool {
        self.cursor < self.want
    }

    /// Bytes still needed to reach the target.
    pub fn remaining_want(&self) -> usize {
        self.want.saturating_sub(self.cursor)
    }

    /// Current cursor position.
    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor. Bytes past the new position are treated as scratch.
    pub fn set_cursor(&mut self, pos: usize) {
        debug_assert!(pos <= self.buf.len(), "cursor past staged bytes");
        self.cursor = pos;
    }

    /// Set a new target size without touching the cursor.
    pub fn set_want(&mut self, want: usize) {
        self.want = want;
    }

    /// Bytes filled so far (inbound) or staged for writing (outbound).
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.cursor]
    }

    /// Make one read attempt from `src` toward the target.
    ///
    /// Returns the byte count from the underlying `read`, so `Ok(0)` means
    /// end of stream whenever the queue was hungry.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let end = self.cursor + self.remaining_want().min(MAX_READ_CHUNK);
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }

        let n = src.read(&mut self.buf[self.cursor..end])?;
        self.cursor += n;
        Ok(n)
    }

    /// Make one write attempt of the unflushed bytes to `dst`.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        let n = dst.write(&self.buf[self.cursor..self.want])?;
        self.cursor += n;
        Ok(n)
    }

    /// Take the filled bytes out of the queue without copying them.
    ///
    /// The queue keeps its cursor and want; callers reset both for the next
    /// phase. Scratch space past the cursor is discarded.
    pub fn extract_buffer(&mut self) -> Bytes {
        self.buf.truncate(self.cursor);
        self.buf.split().freeze()
    }
}
