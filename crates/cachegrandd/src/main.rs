//! cachegrandd — cachegrand cache daemon.

mod config;
mod resp;
mod server;

use std::sync::Arc;

use anyhow::Result;
use cachegrand_core::storage_db::{StorageDb, TtlPolicy};

fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity,
    // e.g. RUST_LOG=debug cargo run -p cachegrandd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut settings = config::DaemonConfig::load()?;
    if let Some(port) = std::env::args().nth(1).and_then(|a| a.parse().ok()) {
        settings.network.port = port;
    }

    tracing::info!(
        bind_address = %settings.network.bind_address,
        port = settings.network.port,
        max_keys = settings.storage.max_keys,
        "cachegrandd starting"
    );

    let ttl_policy = TtlPolicy {
        default_ttl_ms: settings.storage.default_ttl_ms,
        max_ttl_ms: settings.storage.max_ttl_ms,
    };
    let storage = Arc::new(StorageDb::new(settings.storage.max_keys, ttl_policy));
    let active_connections = Arc::new(server::ActiveConnections::default());

    let addr: std::net::SocketAddr = format!("{}:{}", settings.network.bind_address, settings.network.port)
        .parse()
        .expect("bind_address/port must form a valid socket address");

    tokio_uring::start(async move {
        if let Err(err) = server::run(addr, storage, active_connections, settings.snapshot).await {
            tracing::error!(?err, "server loop exited");
        }
    });

    Ok(())
}
