//! WebSocket Surface Server
//!
//! Accepts WebSocket clients and wires each one to the supervisor:
//! - outbound: a [`RemoteSink`] subscription renders events into JSON frames
//! - inbound: JSON envelopes become supervisor commands
//!
//! # Multi-Surface Architecture
//!
//! ```text
//!                      SurfaceServer
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//!      Web client      Web client      Web client
//!       (conn-1)        (conn-2)        (conn-3)
//!           │               │               │
//!           └───────────────┴───────────────┘
//!                           │
//!              Broadcaster ◀─┴─▶ SupervisorHandle
//! ```
//!
//! A new client first receives one `status` frame with the current state.
//! Malformed frames are answered with an `error` frame to that client only.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Instrument};

use agent_conductor::{Broadcaster, ClientMessage, RemoteSink, ServerConfig, ServerMessage};

use crate::commands::{LoopClosed, SupervisorHandle};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Identifier of one WebSocket connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    connected_at: Instant,
    peer: SocketAddr,
    abort_handle: tokio::task::AbortHandle,
}

/// The WebSocket server
pub struct SurfaceServer {
    config: ServerConfig,
    broadcaster: Broadcaster,
    handle: SupervisorHandle,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl SurfaceServer {
    /// Create a server for the given supervisor
    #[must_use]
    pub fn new(config: ServerConfig, broadcaster: Broadcaster, handle: SupervisorHandle) -> Self {
        Self {
            config,
            broadcaster,
            handle,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_address))?;
        info!(address = %self.config.bind_address, "Listening for WebSocket surfaces");
        Ok(listener)
    }

    /// Accept connections until `shutdown` turns true
    pub async fn run(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let broadcaster = self.broadcaster.clone();
        let cleanup = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                broadcaster.cleanup_disconnected();
            }
        });

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping accept loop");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer),
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        cleanup.abort();
        self.shutdown();
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if self.connection_states.len() >= self.config.max_connections {
            warn!(%peer, "Connection limit reached, rejecting new connection");
            drop(stream);
            return;
        }

        let conn_id = ConnectionId::next();
        info!(
            %conn_id,
            %peer,
            active_connections = self.connection_states.len() + 1,
            "New connection accepted"
        );

        let connection = Connection {
            conn_id,
            broadcaster: self.broadcaster.clone(),
            handle: self.handle.clone(),
            channel_capacity: self.config.channel_capacity,
            max_message_size: self.config.max_message_size,
        };
        let connection_states = Arc::clone(&self.connection_states);
        let task = tokio::spawn(
            async move {
                connection.serve(stream).await;
                connection_states.remove(&conn_id);
                info!(
                    active_connections = connection_states.len(),
                    "Connection handler finished"
                );
            }
            .instrument(tracing::info_span!("connection", %conn_id)),
        );

        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                peer,
                abort_handle: task.abort_handle(),
            },
        );
    }

    /// Abort every connection handler
    fn shutdown(&self) {
        info!(
            connections = self.connection_count(),
            "Closing WebSocket connections"
        );
        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                debug!(
                    %conn_id,
                    peer = %state.peer,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }
    }

    /// Get number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

/// Per-connection context
struct Connection {
    conn_id: ConnectionId,
    broadcaster: Broadcaster,
    handle: SupervisorHandle,
    channel_capacity: usize,
    max_message_size: usize,
}

impl Connection {
    async fn serve(&self, stream: TcpStream) {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        ws_config.max_frame_size = Some(self.max_message_size);

        let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(self.channel_capacity);
        let subscriber_id = self
            .broadcaster
            .subscribe_labeled(format!("ws {}", self.conn_id), RemoteSink::new(frame_tx));

        let snapshot = ServerMessage::Status {
            status: self.handle.state(),
        };
        if let Some(json) = encode(&snapshot) {
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                warn!(error = %e, "Failed to send status snapshot");
                self.broadcaster.unsubscribe(subscriber_id);
                return;
            }
        }

        loop {
            tokio::select! {
                incoming = ws_rx.next() => {
                    let reply = match incoming {
                        Some(Ok(Message::Text(text))) => match self.dispatch(&text).await {
                            Ok(reply) => reply,
                            Err(LoopClosed) => {
                                warn!("Supervisor is gone, closing connection");
                                break;
                            }
                        },
                        Some(Ok(Message::Binary(_))) => {
                            Some(ServerMessage::error("binary frames are not supported"))
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client disconnected");
                            break;
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => {
                            warn!(error = %e, "Read error");
                            break;
                        }
                    };
                    if let Some(json) = reply.as_ref().and_then(encode) {
                        if let Err(e) = ws_tx.send(Message::Text(json)).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                }

                outbound = frame_rx.recv() => {
                    let Some(json) = outbound else {
                        info!("Subscription closed");
                        break;
                    };
                    if let Err(e) = ws_tx.send(Message::Text(json)).await {
                        warn!(error = %e, "Write error");
                        break;
                    }
                }
            }
        }

        self.broadcaster.unsubscribe(subscriber_id);
        let _ = ws_tx.close().await;
    }

    /// Apply one inbound frame; returns a reply for this client only
    async fn dispatch(&self, text: &str) -> Result<Option<ServerMessage>, LoopClosed> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Malformed frame");
                return Ok(Some(ServerMessage::error(format!("invalid message: {e}"))));
            }
        };
        debug!(message = ?message, "Received frame");

        match message {
            ClientMessage::Task { text } => self.handle.send(text).await?,
            ClientMessage::StartDaemon { provider, model } => {
                self.handle
                    .start(provider.as_deref(), model.as_deref())
                    .await?;
            }
            ClientMessage::StopDaemon => self.handle.stop().await?,
        }
        Ok(None)
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match message.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            None
        }
    }
}
