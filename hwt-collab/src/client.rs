//! WebSocket transport to a [`RelayServer`](crate::server::RelayServer).
//!
//! A supervisor task owns the socket. It reconnects with exponential
//! back-off, sends heartbeats, and reports every (re)connection and loss as
//! a [`TransportEvent`]. Outgoing messages are only accepted while a
//! connection is up; the engine requeues unacknowledged operations itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::SyncMessage;
use crate::transport::{SyncTransport, TransportError, TransportEvent};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    /// First reconnect delay; doubles up to `reconnect_max`.
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    Lost,
    Shutdown,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Auto-reconnecting WebSocket transport.
pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    connected: Arc<AtomicBool>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    shutdown: watch::Sender<bool>,
}

impl WsTransport {
    /// Start the supervisor. Connection happens in the background; watch
    /// for [`TransportEvent::Connected`].
    pub fn spawn(config: ClientConfig) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(supervise(
            config,
            outgoing_rx,
            events,
            connected.clone(),
            shutdown_rx,
        ));

        Self {
            outgoing,
            connected,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl SyncTransport for WsTransport {
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.outgoing.send(msg).map_err(|_| TransportError::Closed)
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn supervise(
    config: ClientConfig,
    mut outgoing: mpsc::UnboundedReceiver<SyncMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = config.reconnect_initial;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                log::info!("Connected to relay at {}", config.url);
                backoff = config.reconnect_initial;
                connected.store(true, Ordering::SeqCst);
                if events.send(TransportEvent::Connected).is_err() {
                    break;
                }

                let end = run_connection(socket, &config, &mut outgoing, &events, &mut shutdown).await;

                connected.store(false, Ordering::SeqCst);
                // Anything still queued was meant for the dead connection.
                while outgoing.try_recv().is_ok() {}
                if events.send(TransportEvent::Disconnected).is_err() || end == ConnectionEnd::Shutdown {
                    break;
                }
                log::warn!("Lost connection to {}", config.url);
            }
            Err(e) => {
                log::debug!("Connecting to {} failed: {e}; retrying in {backoff:?}", config.url);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }

    log::debug!("Transport supervisor for {} stopped", config.url);
}

async fn run_connection(
    socket: Socket,
    config: &ClientConfig,
    outgoing: &mut mpsc::UnboundedReceiver<SyncMessage>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    let _ = sink.close().await;
                    return ConnectionEnd::Shutdown;
                };
                match msg.encode() {
                    Ok(bytes) => {
                        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                            log::debug!("WebSocket send failed: {e}");
                            return ConnectionEnd::Lost;
                        }
                    }
                    Err(e) => log::error!("Failed to encode {}: {e}", msg.name()),
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if events.send(TransportEvent::Message(msg)).is_err() {
                                let _ = sink.close().await;
                                return ConnectionEnd::Shutdown;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame from relay: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Lost,
                    Some(Err(e)) => {
                        log::debug!("WebSocket error: {e}");
                        return ConnectionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                }
            }

            _ = heartbeat.tick() => {
                let ping = match SyncMessage::Ping.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode heartbeat: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Binary(ping.into())).await.is_err() {
                    return ConnectionEnd::Lost;
                }
            }

            _ = shutdown.changed() => {
                let _ = sink.close().await;
                return ConnectionEnd::Shutdown;
            }
        }
    }
}
