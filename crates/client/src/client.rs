//! WebSocket RPC client for a single agent.
//!
//! Implements the request-response pattern with UUID correlation,
//! ping/pong keepalive, and push event dispatching. Every request carries
//! the client's session id so the agent keeps the session (and any lock
//! it holds) alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use benchlink_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT};
use benchlink_protocol::envelope::Message;
use benchlink_protocol::messages::*;

use crate::error::ClientError;

/// Callback type for push events from the agent, e.g. `"POWER ON"`.
pub type EventCallback = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;
pub(crate) type EventSlot = Arc<Mutex<Option<EventCallback>>>;

const WRITE_QUEUE_SIZE: usize = 256;

/// WebSocket client connected to a single agent.
pub struct AgentClient {
    host: String,
    session: Option<String>,
    request_timeout: Duration,
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Pending,
    on_event: EventSlot,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
}

impl AgentClient {
    /// Connects to the agent at `url` (e.g. `ws://bench-1:5556`).
    ///
    /// `session` identifies this client towards the session manager; pass
    /// `None` for anonymous, read-only use.
    pub async fn connect(url: &str, session: Option<String>) -> Result<Self, ClientError> {
        let host = data_host(url)?;

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let on_event: EventSlot = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            on_event.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            cancel.clone(),
        ));

        debug!(url, session = session.as_deref(), "connected to agent");
        Ok(Self {
            host,
            session,
            request_timeout: WS_REQUEST_TIMEOUT,
            write_tx,
            pending,
            on_event,
            cancel,
            read_handle,
            write_handle,
            ping_handle,
        })
    }

    /// Host name of the agent, used for the image data channel.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Overrides the per-request timeout.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Sets the callback for push events from the agent.
    pub async fn set_event_callback(&self, cb: EventCallback) {
        *self.on_event.lock().await = Some(cb);
    }

    /// Returns `true` while the connection pumps are running.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Sends a request and waits for the response.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?.with_session(self.session.clone());
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(ClientError::Agent {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Sends a request and decodes the response payload.
    async fn call<T, R>(&self, msg_type: MessageType, payload: Option<&T>) -> Result<R, ClientError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let resp = self.send_request(msg_type, payload).await?;
        resp.parse_payload()?
            .ok_or(ClientError::MissingPayload(msg_type))
    }

    async fn call_bool(&self, msg_type: MessageType) -> Result<bool, ClientError> {
        let resp: BoolResponse = self.call::<(), _>(msg_type, None).await?;
        Ok(resp.result)
    }

    async fn call_status(&self, msg_type: MessageType) -> Result<String, ClientError> {
        let resp: StatusResponse = self.call::<(), _>(msg_type, None).await?;
        Ok(resp.status)
    }

    // -----------------------------------------------------------------------
    // Connection and sessions
    // -----------------------------------------------------------------------

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send_request::<()>(MessageType::Ping, None).await?;
        Ok(())
    }

    pub async fn get_info(&self) -> Result<InfoResponse, ClientError> {
        self.call::<(), _>(MessageType::GetInfo, None).await
    }

    /// Refreshes this client's session.
    pub async fn session_check(&self) -> Result<(), ClientError> {
        self.send_request::<()>(MessageType::SessionCheck, None)
            .await?;
        Ok(())
    }

    /// Tries to acquire the device lock.
    pub async fn session_lock(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::SessionLock).await
    }

    /// Returns the session holding the device lock, if any.
    pub async fn session_locked(&self) -> Result<Option<String>, ClientError> {
        let resp: LockedResponse = self.call::<(), _>(MessageType::SessionLocked, None).await?;
        Ok(resp.holder)
    }

    pub async fn session_unlock(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::SessionUnlock).await
    }

    /// Changes the agent's session timeout and returns the previous one.
    pub async fn session_set_timeout(&self, timeout: Duration) -> Result<Duration, ClientError> {
        let req = SetTimeoutRequest {
            timeout_secs: timeout.as_secs(),
        };
        let resp: SetTimeoutResponse = self
            .call(MessageType::SessionSetTimeout, Some(&req))
            .await?;
        Ok(Duration::from_secs(resp.previous_secs))
    }

    // -----------------------------------------------------------------------
    // Target power
    // -----------------------------------------------------------------------

    pub async fn target_on(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::TargetOn).await
    }

    pub async fn target_off(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::TargetOff).await
    }

    /// Toggles power and returns the new status (`"ON"`, `"OFF"`, `"???"`).
    pub async fn target_toggle(&self) -> Result<String, ClientError> {
        self.call_status(MessageType::TargetToggle).await
    }

    pub async fn target_status(&self) -> Result<String, ClientError> {
        self.call_status(MessageType::TargetStatus).await
    }

    /// Time since the target was last powered on; zero while off.
    pub async fn target_uptime(&self) -> Result<Duration, ClientError> {
        let resp: UptimeResponse = self.call::<(), _>(MessageType::TargetUptime, None).await?;
        Ok(Duration::from_secs_f64(resp.seconds.max(0.0)))
    }

    pub async fn power_locked(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::PowerLocked).await
    }

    // -----------------------------------------------------------------------
    // Shared storage
    // -----------------------------------------------------------------------

    pub async fn storage_open(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::StorageOpen).await
    }

    pub async fn storage_close(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::StorageClose).await
    }

    pub async fn storage_status(&self) -> Result<StorageStatusResponse, ClientError> {
        self.call::<(), _>(MessageType::StorageStatus, None).await
    }

    pub async fn storage_to_host(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::StorageToHost).await
    }

    pub async fn storage_to_target(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::StorageToTarget).await
    }

    /// Moves the shared storage to the other side and returns where it is now.
    pub async fn storage_swap(&self) -> Result<String, ClientError> {
        self.call_status(MessageType::StorageSwap).await
    }

    pub async fn storage_locked(&self) -> Result<bool, ClientError> {
        self.call_bool(MessageType::StorageLocked).await
    }

    /// Selects the codec of the next image stream; returns the previous one.
    pub async fn storage_compression(&self, compression: &str) -> Result<String, ClientError> {
        let req = CompressionRequest {
            compression: compression.to_string(),
        };
        let resp: CompressionResponse = self
            .call(MessageType::StorageCompression, Some(&req))
            .await?;
        Ok(resp.previous)
    }

    /// Attaches a block-map descriptor to the next transfer, or clears it.
    pub async fn storage_bmap(
        &self,
        descriptor: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        let req = BmapRequest { descriptor };
        self.send_request(MessageType::StorageBmap, Some(&req))
            .await?;
        Ok(())
    }

    /// Starts a transfer and returns the data channel port.
    pub async fn storage_start(&self) -> Result<u16, ClientError> {
        let resp: StartResponse = self.call::<(), _>(MessageType::StorageStart, None).await?;
        Ok(resp.port)
    }

    /// Declares the total number of bytes sent on the data channel.
    pub async fn storage_flush(&self, total: u64) -> Result<bool, ClientError> {
        let resp: BoolResponse = self
            .call(MessageType::StorageFlush, Some(&FlushRequest { total }))
            .await?;
        Ok(resp.result)
    }

    pub async fn storage_bytes_written(&self) -> Result<u64, ClientError> {
        let resp: BytesWrittenResponse = self
            .call::<(), _>(MessageType::StorageBytesWritten, None)
            .await?;
        Ok(resp.written)
    }

    // -----------------------------------------------------------------------
    // USB switches (1-based port numbers)
    // -----------------------------------------------------------------------

    pub async fn usb_ports(&self) -> Result<usize, ClientError> {
        let resp: UsbPortsResponse = self.call::<(), _>(MessageType::UsbPorts, None).await?;
        Ok(resp.ports)
    }

    pub async fn usb_on(&self, port: usize) -> Result<bool, ClientError> {
        let resp: BoolResponse = self
            .call(MessageType::UsbOn, Some(&UsbPortRequest { port }))
            .await?;
        Ok(resp.result)
    }

    pub async fn usb_off(&self, port: usize) -> Result<bool, ClientError> {
        let resp: BoolResponse = self
            .call(MessageType::UsbOff, Some(&UsbPortRequest { port }))
            .await?;
        Ok(resp.result)
    }

    pub async fn usb_toggle(&self, port: usize) -> Result<String, ClientError> {
        let resp: StatusResponse = self
            .call(MessageType::UsbToggle, Some(&UsbPortRequest { port }))
            .await?;
        Ok(resp.status)
    }

    pub async fn usb_status(&self, port: usize) -> Result<String, ClientError> {
        let resp: StatusResponse = self
            .call(MessageType::UsbStatus, Some(&UsbPortRequest { port }))
            .await?;
        Ok(resp.status)
    }

    pub async fn usb_find_by_class(&self, class: &str) -> Result<Option<usize>, ClientError> {
        let req = UsbClassRequest {
            class: class.to_string(),
        };
        let resp: UsbFindResponse = self.call(MessageType::UsbFindByClass, Some(&req)).await?;
        Ok(resp.port)
    }

    // -----------------------------------------------------------------------
    // Console
    // -----------------------------------------------------------------------

    async fn console_data(&self, msg_type: MessageType) -> Result<Option<String>, ClientError> {
        let resp: ConsoleDataResponse = self.call::<(), _>(msg_type, None).await?;
        Ok(resp.data)
    }

    /// Pops the oldest buffered console line.
    pub async fn console_head(&self) -> Result<Option<String>, ClientError> {
        self.console_data(MessageType::ConsoleHead).await
    }

    pub async fn console_lines(&self) -> Result<usize, ClientError> {
        let resp: ConsoleLinesResponse =
            self.call::<(), _>(MessageType::ConsoleLines, None).await?;
        Ok(resp.lines)
    }

    /// Returns the most recent console output and discards the buffer.
    pub async fn console_tail(&self) -> Result<Option<String>, ClientError> {
        self.console_data(MessageType::ConsoleTail).await
    }

    pub async fn console_dump(&self) -> Result<Option<String>, ClientError> {
        self.console_data(MessageType::ConsoleDump).await
    }

    /// Discards buffered console output and returns what was dropped.
    pub async fn console_clear(&self) -> Result<Option<String>, ClientError> {
        self.console_data(MessageType::ConsoleClear).await
    }

    pub async fn console_send(&self, data: &str) -> Result<(), ClientError> {
        let req = ConsoleSendRequest {
            data: data.to_string(),
        };
        self.send_request(MessageType::ConsoleSend, Some(&req))
            .await?;
        Ok(())
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

/// Extracts the host part of a WebSocket URL.
fn data_host(url: &str) -> Result<String, ClientError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ClientError::Url(format!("{url}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| ClientError::Url(format!("{url}: missing host")))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}
