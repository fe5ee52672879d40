//! WebSocket server for the benchlink agent.
//!
//! Accepts client connections over WebSocket, dispatches JSON requests to
//! a [`Handler`] trait, pushes events to every client through a
//! [`Broadcaster`], and manages the connection lifecycle (ping/pong,
//! graceful shutdown).

mod connection;
mod handler;
mod server;

pub use connection::{Broadcaster, ClientConnection, ClientMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{AgentServer, ServerConfig};

/// Per-client send buffer capacity.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the agent server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("client limit reached")]
    TooManyClients,
}
