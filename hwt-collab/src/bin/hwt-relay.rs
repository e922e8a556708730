//! Standalone relay server.
//!
//! `HWT_RELAY_ADDR` sets the bind address (default `127.0.0.1:9090`);
//! `HWT_RELAY_DATA` enables the file log store in that directory.

use std::path::PathBuf;

use hwt_collab::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("HWT_RELAY_ADDR") {
        config.bind_addr = addr;
    }
    config.storage_path = std::env::var_os("HWT_RELAY_DATA").map(PathBuf::from);

    log::info!(
        "Starting hwt-relay on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(dir) => format!("log store at {}", dir.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = RelayServer::new(config)?;
    server.run().await?;
    Ok(())
}
