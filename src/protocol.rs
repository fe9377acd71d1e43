//! Wire framing for the log ingestion protocol.
//!
//! A connection carries a stream of frames with no other metadata:
//!
//! ```text
//! +----------------------+-------------------------------+
//! | length (u32, BE)     | payload (length bytes)        |
//! +----------------------+-------------------------------+
//!        4 bytes                  variable
//! ```
//!
//! There is no checksum and no message-type tag. A zero length is valid and
//! carries an empty record.

use bytes::{Buf, BufMut};
use std::io;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Which part of a frame a connection is currently assembling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    /// Collecting the 4-byte length prefix.
    AwaitingHeader,
    /// Collecting the payload announced by the last header.
    AwaitingPayload,
}

/// Decode a complete length prefix into the number of payload bytes.
///
/// `header` must hold at least [`HEADER_LEN`] bytes; only the first four are
/// read.
pub fn decode_length(header: &[u8]) -> io::Result<usize> {
    if header.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("short frame header: {} bytes", header.len()),
        ));
    }

    let len = (&header[..HEADER_LEN]).get_u32();
    usize::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds address space"),
        )
    })
}

/// Encode a length prefix announcing `len` payload bytes.
pub fn encode_header(len: usize) -> io::Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} does not fit in a header"),
        )
    })?;

    let mut header = [0u8; HEADER_LEN];
    (&mut header[..]).put_u32(len);
    Ok(header)
}

/// Encode `payload` as a single frame.
#[cfg(test)]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&encode_header(payload.len()).unwrap());
    out.put_slice(payload);
    out
}
