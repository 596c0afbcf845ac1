//! Parley Server
//!
//! Binds one UDP address and serves key exchanges, sealed messages,
//! register/login and relay until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UdpSocket;
use tracing::info;

use parley_core::config::load_config;
use parley_core::tracing_init::init_tracing;
use parley_crypto::ModulusGroup;
use parley_proto::Identity;
use parley_server::auth::CredentialService;
use parley_server::storage::UserDatabase;
use parley_server::{Dispatcher, SessionRegistry, serve};

#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(version, about = "Parley server - encrypted datagram chat relay")]
struct Args {
    /// Address to bind.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to the modulus group file.
    #[arg(long)]
    group: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Path to a settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?.server;
    if let Some(addr) = args.addr {
        config.bind_addr = addr;
    }
    if let Some(group) = args.group {
        config.group_path = group;
    }
    if args.db_path.is_some() {
        config.database_path = args.db_path;
    }

    init_tracing(&format!("parley_server={}", config.log_level), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr,
        "Starting parley-server"
    );

    let group = Arc::new(ModulusGroup::load(&config.group_path)?);
    info!(
        path = %config.group_path.display(),
        bits = group.prime().bits(),
        "Modulus group loaded"
    );

    let db_path = config
        .resolved_database_path()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    info!(path = %db_path.display(), "Opening user database");
    let db = UserDatabase::open(&db_path).await?;

    let identity = Identity::new(config.identity.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        identity.clone(),
        SessionRegistry::new(identity.clone(), group),
        CredentialService::new(db, identity),
        config.max_datagram_bytes,
    ));

    let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    info!(addr = %socket.local_addr()?, "Server listening");

    tokio::select! {
        () = serve(socket, dispatcher) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Server stopped");
    Ok(())
}
