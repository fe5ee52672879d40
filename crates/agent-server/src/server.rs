//! Agent WebSocket server.
//!
//! Listens on a TCP port, upgrades connections to WebSocket, and serves
//! any number of clients (up to a limit) concurrently.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use benchlink_protocol::constants::{DEFAULT_AGENT_PORT, WS_MAX_MESSAGE_SIZE};

use crate::ServerError;
use crate::connection::{self, Broadcaster, ClientMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Connections beyond this count are refused.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_AGENT_PORT,
            max_clients: 16,
        }
    }
}

/// The agent WebSocket server.
///
/// Dispatches messages from every connected client to the provided
/// [`Handler`], and registers each connection with the [`Broadcaster`].
pub struct AgentServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    broadcaster: Broadcaster,
    next_id: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> AgentServer<H> {
    /// Creates a new server with the given handler.
    ///
    /// The caller keeps a clone of `broadcaster` to push events to all
    /// clients.
    pub fn new(config: ServerConfig, handler: Arc<H>, broadcaster: Broadcaster) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            broadcaster,
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.broadcaster.len()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("agent server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection for its whole lifetime.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        if self.broadcaster.len() >= self.config.max_clients {
            tracing::warn!(%peer_addr, "rejecting connection: client limit reached");
            return Err(ServerError::TooManyClients);
        }

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let meta = ClientMeta {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr: peer_addr.to_string(),
        };
        tracing::info!(client = meta.id, %peer_addr, "WebSocket connection established");

        let conn = connection::spawn_connection(
            ws_stream,
            meta.clone(),
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        self.broadcaster.register(meta.id, conn.sender());

        conn.closed().await;
        self.broadcaster.unregister(meta.id);
        Ok(())
    }
}
