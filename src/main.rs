//! frameport: a length-prefixed TCP frame server
//!
//! A single readiness loop services one listening socket and every accepted
//! connection. Each connection carries an ordered stream of frames:
//!
//! ```text
//! [4 bytes: big-endian unsigned length L] [L bytes: opaque payload]
//! ```
//!
//! Features:
//! - select-style multiplexing over one thread (mio: epoll/kqueue)
//! - incremental frame reassembly across partial reads
//! - per-connection failures absorbed without disturbing other peers
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        "Starting frameport server"
    );

    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }

    Ok(())
}
