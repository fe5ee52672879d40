use benchlink_protocol::MessageType;
use tokio_tungstenite::tungstenite;

/// Errors from the agent client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("agent error {code}: {message}")]
    Agent { code: i32, message: String },

    #[error("missing payload in {0:?} response")]
    MissingPayload(MessageType),

    #[error("invalid agent URL: {0}")]
    Url(String),

    #[error("image write failed after {written} bytes")]
    WriteFailed { written: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "request timed out");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");

        let err = ClientError::Agent {
            code: 423,
            message: "device is locked".into(),
        };
        assert!(err.to_string().contains("423"));

        let err = ClientError::WriteFailed { written: 4096 };
        assert_eq!(err.to_string(), "image write failed after 4096 bytes");
    }
}
