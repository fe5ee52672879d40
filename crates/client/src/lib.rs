//! Client side of the benchlink agent protocol.
//!
//! Provides the WebSocket RPC client, with UUID request correlation,
//! ping/pong keepalive and push event dispatching, and the image uploader
//! that streams disk images to the agent's shared storage.

pub mod client;
pub mod error;
mod pumps;
pub mod upload;

pub use client::{AgentClient, EventCallback};
pub use error::ClientError;
pub use upload::{UploadOptions, UploadProgress, UploadReport};
