//! Single-threaded ingest runtime.
//!
//! - `ByteQueue`: per-connection staging for partial reads and writes
//! - `Connection`: length-prefixed framing state machine
//! - `EventLoop`: mio reactor that accepts connections and drives them

mod buffer;
mod connection;
mod mio;

pub(crate) use connection::{Connection, ConnectionRegistry};
pub use self::mio::EventLoop;

use crate::collector::Collector;
use crate::config::Config;
use tracing::info;

/// Bind the configured address and serve until the listener fails.
pub fn run<C: Collector>(config: &Config, collector: &mut C) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(config)?;
    info!(addr = %event_loop.local_addr(), "Listening for log streams");
    event_loop.run(collector)
}
