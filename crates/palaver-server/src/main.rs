//! Palaver server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address with the default database file
//! palaver-server
//!
//! # Explicit address and database path
//! palaver-server --bind 0.0.0.0:3000 --store /var/lib/palaver/chat.redb
//! ```

use std::time::Duration;

use clap::Parser;
use palaver_core::SessionConfig;
use palaver_server::{DispatcherConfig, RedbStorage, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Palaver chat coordination server
#[derive(Parser, Debug)]
#[command(name = "palaver-server")]
#[command(about = "Chat room coordination server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, env = "PALAVER_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// Path to the room and message database
    #[arg(short, long, env = "PALAVER_STORE", default_value = "palaver.redb")]
    store: std::path::PathBuf,

    /// Seconds a client may stay connected without choosing a name
    #[arg(long, env = "PALAVER_NAME_TIMEOUT", default_value_t = 60)]
    name_timeout: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 10_000)]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("palaver server starting");
    tracing::info!("binding to {}", args.bind);
    tracing::info!("database at {}", args.store.display());

    let storage = RedbStorage::open(&args.store)?;

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        driver: DispatcherConfig {
            session: SessionConfig { name_timeout: Duration::from_secs(args.name_timeout) },
            max_connections: args.max_connections,
        },
    };

    let server = Server::bind(config, storage).await?;

    tracing::info!("server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
