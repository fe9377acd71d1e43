//! Connection state machine for ingest connections.
//!
//! Each connection owns its stream and two staging queues. The read queue
//! alternates between collecting a 4-byte length header and collecting the
//! payload that header announced; every completed payload is handed to the
//! collector. The write queue holds handshake bytes that must be flushed
//! before the connection settles into read-only interest.
//!
//! A connection never tears itself down. Its event handlers return `Err` on
//! end of stream or a fatal I/O error, and the owner of the
//! [`ConnectionRegistry`] removes the entry, which drops the stream and
//! closes the descriptor.

use crate::collector::Collector;
use crate::protocol::{decode_length, FramingState, HEADER_LEN};
use crate::runtime::buffer::ByteQueue;
use bytes::Bytes;
use slab::Slab;
use std::io::{self, Read, Write};

/// A single ingest connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    read_queue: ByteQueue,
    write_queue: ByteQueue,
    state: FramingState,
}

impl<S: Read + Write> Connection<S> {
    /// Create a connection awaiting its first header, with `handshake`
    /// queued for writing.
    pub fn new(stream: S, handshake: &[u8]) -> Self {
        Self {
            stream,
            read_queue: ByteQueue::new(HEADER_LEN),
            write_queue: ByteQueue::outbound(handshake),
            state: FramingState::AwaitingHeader,
        }
    }

    /// Underlying stream, for reactor registration.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Current framing state.
    #[cfg(test)]
    pub fn state(&self) -> FramingState {
        self.state
    }

    /// True while handshake bytes remain unflushed.
    pub fn wants_write(&self) -> bool {
        self.write_queue.hungry()
    }

    /// Drain readable bytes, handing every completed frame to `collector`.
    ///
    /// Reads until the stream would block, so one call may complete any
    /// number of frames. Returns how many were completed. End of stream
    /// (including mid-frame) and fatal errors are returned as `Err`; the
    /// partial frame is discarded with the connection.
    pub fn on_readable<C: Collector>(&mut self, collector: &mut C) -> io::Result<usize> {
        let mut frames = 0;

        loop {
            while self.read_queue.hungry() {
                match self.read_queue.read_from(&mut self.stream) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed connection",
                        ));
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(frames),
                    Err(e) => return Err(e),
                }
            }

            if let Some(payload) = self.advance()? {
                collector.append(payload);
                frames += 1;
            }
        }
    }

    /// Flush pending handshake bytes.
    ///
    /// Returns `Ok(true)` once the write queue is empty, at which point the
    /// caller drops writable interest for good.
    pub fn on_writable(&mut self) -> io::Result<bool> {
        while self.write_queue.hungry() {
            match self.write_queue.write_to(&mut self.stream) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer closed connection",
                    ));
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        // Release the handshake storage; nothing is ever queued again.
        self.write_queue = ByteQueue::default();
        Ok(true)
    }

    /// Step the framing state once the read queue is satisfied.
    fn advance(&mut self) -> io::Result<Option<Bytes>> {
        match self.state {
            FramingState::AwaitingHeader => {
                let len = decode_length(self.read_queue.filled())?;
                self.read_queue.set_cursor(0);
                self.read_queue.set_want(len);
                self.state = FramingState::AwaitingPayload;
                Ok(None)
            }
            FramingState::AwaitingPayload => {
                let payload = self.read_queue.extract_buffer();
                self.read_queue.set_cursor(0);
                self.read_queue.set_want(HEADER_LEN);
                self.state = FramingState::AwaitingHeader;
                Ok(Some(payload))
            }
        }
    }
}

/// Registry of live connections using slab allocation.
///
/// The registry is the sole owner of every connection; removing an entry is
/// the only way a connection ends.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Gives the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    ///
    /// Returns `None` if it was already removed, so repeated closes are
    /// harmless.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Drop every connection, closing their streams.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
