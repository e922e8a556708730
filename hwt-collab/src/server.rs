//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── RelaySession (doc 1) ── BroadcastGroup
//!            ├── handle_connection ──── RelayHub
//! Client B ──┘     reader / writer      └── RelaySession (doc 2)
//!                                              │
//!                                              └── FileLogStore
//!                                                    ├── <doc>.log  (sequenced ops)
//!                                                    └── <doc>.ckpt (LZ4 checkpoint)
//! ```
//!
//! Each connection gets a reader that decodes frames into `serve_peer`'s
//! inbound channel and a writer that encodes its outbound channel back to
//! the socket. The relay logic itself lives in [`crate::relay`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::protocol::SyncMessage;
use crate::relay::{serve_peer, RelayHub, RelayStats};
use crate::storage::{shared, FileLogStore, FileStoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// fsync every appended operation
    pub sync_writes: bool,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            sync_writes: false,
            relay: RelayConfig::default(),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
}

impl RelayServer {
    /// Create a server, opening (and recovering) the log store if a
    /// storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(dir) => {
                let store = FileLogStore::open(FileStoreConfig {
                    dir: dir.clone(),
                    sync_writes: config.sync_writes,
                })?;
                log::info!("Relay log store at {}", dir.display());
                Some(shared(store))
            }
            None => None,
        };

        Ok(Self {
            hub: Arc::new(RelayHub::new(config.relay.clone(), store)),
            config,
        })
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self {
            hub: Arc::new(RelayHub::new(RelayConfig::default(), None)),
            config: ServerConfig::default(),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.hub.stats().await
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<RelayHub>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = socket.split();
    log::info!("WebSocket connection established from {addr}");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<SyncMessage>(hub.config().broadcast_capacity);
    let peer = tokio::spawn(serve_peer(hub, inbound_rx, outbound_tx));

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let bytes = match msg.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to encode {}: {e}", msg.name());
                    continue;
                }
            };
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                Ok(msg) => {
                    if inbound_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
            },
            Ok(Message::Close(_)) => {
                log::info!("Connection closed from {addr}");
                break;
            }
            Err(e) => {
                log::debug!("WebSocket error from {addr}: {e}");
                break;
            }
            Ok(_) => {}
        }
    }

    drop(inbound_tx);
    let _ = peer.await;
    let _ = writer.await;
    Ok(())
}
