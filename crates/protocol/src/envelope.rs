use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::MessageType;

/// Failure reported in place of a response payload.
///
/// `code` follows HTTP conventions, e.g. 423 when another session holds
/// the lock or 503 when the device has no driver for the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// Errors produced while extracting a request payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("missing payload")]
    Missing,

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// One agent RPC frame: request, response, error or pushed event.
///
/// Responses reuse the id of their request; events carry `event-N` ids.
/// `session` names the caller on requests and drives liveness tracking
/// and lock arbitration. The payload stays raw JSON until the handler for
/// `msg_type` knows which struct to decode it into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            msg_type,
            session: None,
            payload: payload.map(serde_json::value::to_raw_value).transpose()?,
            error: None,
        })
    }

    /// Tags a request with the caller's session.
    pub fn with_session(mut self, session: Option<String>) -> Self {
        self.session = session;
        self
    }

    /// Decodes the payload, if any.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// Decodes the payload of a request type that cannot go without one.
    pub fn require_payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        self.parse_payload()?.ok_or(PayloadError::Missing)
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            session: None,
            payload: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Answers this request with `msg_type`, keeping its id for correlation.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(self.id.as_str(), msg_type, payload)
    }

    /// Refuses this request with `code`.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(self.id.as_str(), code, message)
    }
}
