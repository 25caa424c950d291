//! Rendezvous Signal Server
//!
//! UDP rendezvous server for peer discovery and NAT traversal.
//!
//! # Usage
//!
//! ```bash
//! # In-memory rooms (default)
//! rendezvous-signal --port 4300
//!
//! # Rooms kept in SQLite
//! rendezvous-signal --port 4300 --db /var/lib/rendezvous/rooms.db
//!
//! # Rooms kept in Redis
//! rendezvous-signal --store redis --store-host 10.0.0.5 --store-port 6379
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rendezvous_core::{Config, StoreBackend, StoreConfig};
use rendezvous_signal::{MemoryStore, RedisStore, RoomStore, SignalServer, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "rendezvous-signal")]
#[command(about = "UDP rendezvous server for peer discovery")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "RENDEZVOUS_CONFIG")]
    config: Option<PathBuf>,

    /// UDP port to listen on
    #[arg(short, long, env = "RENDEZVOUS_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "RENDEZVOUS_BIND")]
    bind: Option<String>,

    /// Room store backend: memory, sqlite or redis
    #[arg(short, long, env = "RENDEZVOUS_STORE")]
    store: Option<String>,

    /// SQLite database path for room storage (implies --store sqlite)
    #[arg(short, long, env = "RENDEZVOUS_DB")]
    db: Option<PathBuf>,

    /// Redis host
    #[arg(long, env = "RENDEZVOUS_STORE_HOST")]
    store_host: Option<String>,

    /// Redis port
    #[arg(long, env = "RENDEZVOUS_STORE_PORT")]
    store_port: Option<u16>,

    /// Seconds without registration or query before a room is reclaimed
    #[arg(long, env = "RENDEZVOUS_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = &args.bind {
        config.server.bind = bind.parse()?;
    }
    if let Some(db) = args.db {
        config.store.backend = StoreBackend::Sqlite;
        config.store.db_path = Some(db);
    }
    if let Some(backend) = &args.store {
        config.store.backend = backend.parse()?;
    }
    if let Some(host) = args.store_host {
        config.store.host = host;
    }
    if let Some(port) = args.store_port {
        config.store.port = port;
    }
    if let Some(secs) = args.idle_timeout {
        config.rooms.idle_timeout_secs = secs;
    }

    let addr = SocketAddr::new(config.server.bind, config.server.port);

    info!("Starting Rendezvous Signal Server");
    info!("Rooms expire after {}s idle", config.rooms.idle_timeout_secs);

    let store = open_store(&config.store).await?;

    // Log storage stats on startup
    match store.room_count().await {
        Ok(count) => info!("Loaded {} live rooms from {} store", count, store.name()),
        Err(e) => warn!("Could not count rooms: {}", e),
    }

    let server = SignalServer::bind(addr, store, &config.rooms).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // Keep serving; dropping the sender would stop the server
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    server.serve(shutdown_rx).await?;

    Ok(())
}

/// Build the configured room store
async fn open_store(
    config: &StoreConfig,
) -> Result<Arc<dyn RoomStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn RoomStore> = match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory room store (no persistence)");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Sqlite => match &config.db_path {
            Some(db_path) => {
                // Create parent directory if it doesn't exist
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                info!("Using SQLite room store: {:?}", db_path);
                Arc::new(SqliteStore::open(db_path)?)
            }
            None => {
                info!("Using in-memory SQLite room store (no db_path set)");
                Arc::new(SqliteStore::in_memory()?)
            }
        },
        StoreBackend::Redis => {
            info!("Using Redis room store at {}:{}", config.host, config.port);
            Arc::new(RedisStore::connect(&config.host, config.port).await?)
        }
    };
    Ok(store)
}
