//! scribe-server — collaborative document server binary.
//!
//! Environment configuration:
//! - `SCRIBE_BIND`   listen address (default `127.0.0.1:9292`)
//! - `SCRIBE_DATA`   RocksDB directory (default `scribe_data`)
//! - `SCRIBE_TOKENS` bearer-token table, `token:user[,token:user…]`
//!
//! Logging through `env_logger` (`RUST_LOG=info` and friends).

use std::sync::Arc;

use log::info;
use scribe_collab::{
    CollabServer, MemoryLockService, RocksStore, ServerConfig, StaticTokenAuth, StoreConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr =
        std::env::var("SCRIBE_BIND").unwrap_or_else(|_| "127.0.0.1:9292".to_string());
    let data_dir = std::env::var("SCRIBE_DATA").unwrap_or_else(|_| "scribe_data".to_string());
    let token_table = std::env::var("SCRIBE_TOKENS").unwrap_or_default();

    let auth = StaticTokenAuth::from_table(&token_table);
    if auth.is_empty() {
        log::warn!("SCRIBE_TOKENS is empty; every handshake will be rejected");
    }

    let store = RocksStore::open(StoreConfig {
        path: data_dir.clone().into(),
        ..StoreConfig::default()
    })?;

    let server = CollabServer::new(
        ServerConfig {
            bind_addr,
            ..ServerConfig::default()
        },
        Arc::new(store),
        Arc::new(MemoryLockService::new()),
        Arc::new(auth),
    );

    info!(
        "scribe-server starting on {} (data in {data_dir})",
        server.bind_addr()
    );
    server.run().await
}
