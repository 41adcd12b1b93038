//! Loom channel server.
//!
//! Hosts one broadcast channel per document and optionally persists shared
//! documents to a RocksDB store so they survive restarts.

use clap::Parser;
use log::info;
use loom_collab::server::{ServerConfig, SyncServer};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "loom-server", about = "Document channel server for Loom")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory for persistent storage; documents live in memory only when omitted
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Maximum peers subscribed to one document
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Per-peer broadcast buffer
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = ServerConfig {
        bind_addr: cli.bind,
        max_peers_per_room: cli.max_peers,
        broadcast_capacity: cli.broadcast_capacity,
        storage_path: cli.storage,
    };
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("Running in memory; documents are lost on exit"),
    }

    let server = Arc::new(SyncServer::new(config)?);
    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            stopper.shutdown();
        }
    });

    server.run().await?;

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} messages, {} saves",
        stats.total_connections, stats.total_messages, stats.persisted_saves
    );
    Ok(())
}
