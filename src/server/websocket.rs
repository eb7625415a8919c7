//! WebSocket server implementation
//!
//! Accepts client connections, upgrades them to WebSocket, and runs one
//! reader task plus one writer task per connection. The writer drains the
//! connection's outbound queue, which is what the registries hold a handle
//! to; the reader feeds frames to the coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::ConnectionCoordinator;
use crate::config::Settings;
use crate::registry::{ConnectionHandle, RoomRegistry, UserRegistry};

/// WebSocket relay server
pub struct WebSocketServer {
    settings: Settings,
    coordinator: Arc<ConnectionCoordinator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a server with fresh registries built from the settings
    pub fn new(settings: Settings) -> Self {
        let users = Arc::new(UserRegistry::new());
        let rooms = Arc::new(RoomRegistry::new(settings.channels.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            coordinator: Arc::new(ConnectionCoordinator::new(users, rooms)),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the server until a shutdown signal is received.
    ///
    /// Each accepted connection gets its own task; connection errors are
    /// logged and never take the accept loop down.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.settings.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("chat relay listening on ws://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let coordinator = Arc::clone(&self.coordinator);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, coordinator, shutdown_rx).await {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection from accept to close
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    coordinator: Arc<ConnectionCoordinator>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("new connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(tx.clone());

    // Writer task: the only owner of the sink. Registry sends queue here and
    // return immediately, so a slow peer cannot stall a broadcast.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let session_id = coordinator.on_connect(&handle).await?;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("frame from {}: {}", peer_addr, text);
                        coordinator.on_message(&handle, session_id, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("binary frame from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong frames
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, closing connection to {}", peer_addr);
                let _ = tx.send(Message::Close(None));
                break;
            }
        }
    }

    coordinator.on_disconnect(&handle, session_id).await;

    // Dropping the queue ends the writer once it has flushed
    drop(handle);
    drop(tx);
    let _ = writer.await;

    info!("connection from {} closed", peer_addr);
    Ok(())
}
