//! logwell: ingestion front-end for a log-collection server
//!
//! Accepts TCP connections carrying a stream of length-prefixed frames
//! (4-byte big-endian length, then that many payload bytes) and hands every
//! completed payload to a collector.
//!
//! Features:
//! - Single-threaded, non-blocking mio reactor
//! - Reassembly of frames split across any number of reads
//! - Optional handshake bytes flushed to each new connection
//! - Records spooled to stdout or a file, optionally timestamped
//! - Configuration via CLI arguments or TOML file

mod collector;
mod config;
mod protocol;
mod runtime;

use collector::Spool;
use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        output = %config.output,
        handshake = config.handshake.is_some(),
        "Starting logwell"
    );

    let mut spool = Spool::open(&config.output, config.timestamps)?;
    let result = runtime::run(&config, &mut spool);

    info!(
        records = spool.records(),
        bytes = spool.bytes(),
        "Collector totals"
    );

    result?;
    Ok(())
}
