pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{MessageType, RequestGroup};
pub use envelope::{Message, WsError};
