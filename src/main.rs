//! echo-server: a concurrent TCP echo server
//!
//! Every byte a client sends is written back unmodified until the client
//! closes its side or the connection fails.
//!
//! Features:
//! - One lightweight task per connection on a single-threaded reactor
//! - Strict read-then-write ordering within a connection
//! - Clean shutdown on SIGINT / SIGTERM, closing every socket
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod error;
mod listener;
mod server;
mod shutdown;

use config::Config;
use server::Server;
use shutdown::ShutdownSignal;
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
        backlog = config.backlog,
        nodelay = config.nodelay,
        read_buffer_size = config.read_buffer_size,
        "Starting echo server"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config).map_err(|e| {
        error!(error = %e, addr_in_use = e.is_addr_in_use(), "Bind failed");
        e
    })?;
    let shutdown = ShutdownSignal::register()?;

    server.run(shutdown.recv()).await;
    Ok(())
}
