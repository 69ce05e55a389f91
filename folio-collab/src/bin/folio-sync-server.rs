//! Folio sync server binary.
//!
//! Usage:
//!   # In-memory documents
//!   cargo run --bin folio-sync-server -- --bind 0.0.0.0:9090
//!
//!   # Persist documents under ./folio_data
//!   cargo run --bin folio-sync-server -- --data-dir folio_data
//!
//! Logging follows `RUST_LOG` (default `info`).

use clap::Parser;
use log::info;

use folio_collab::protocol::AccessReason;
use folio_collab::server::{ServerConfig, SyncServer};

/// Stream authority for collaborative documents.
#[derive(Parser, Debug)]
#[command(name = "folio-sync-server")]
#[command(about = "WebSocket sync server for collaborative documents")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents stay in memory when omitted
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Frames queued per connection before it is dropped as lagging
    #[arg(long, default_value_t = 1024)]
    outbox_capacity: usize,

    /// Admitted updates between document snapshots
    #[arg(long, default_value_t = 100)]
    snapshot_every: u64,

    /// Serve a document read-only (repeatable)
    #[arg(long = "read-only", value_name = "OBJECT_ID")]
    read_only: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = ServerConfig::default()
        .with_bind_addr(args.bind)
        .with_outbox_capacity(args.outbox_capacity)
        .with_snapshot_every(args.snapshot_every);
    if let Some(dir) = args.data_dir {
        config = config.with_storage_path(dir);
    }

    let server = SyncServer::new(config)?;
    for object_id in &args.read_only {
        server
            .set_access(object_id, true, false, AccessReason::PermissionChanged)
            .await;
        info!("Serving {object_id} read-only");
    }

    server.run().await?;
    Ok(())
}
