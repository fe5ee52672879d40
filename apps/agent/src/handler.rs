//! Handler implementation for the agent WS server.
//!
//! `AgentHandler` implements the `agent_server::Handler` trait and maps
//! every request group onto [`Device`] operations.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use benchlink_agent_server::{ClientMeta, Handler, HandlerFuture, Sender};
use benchlink_protocol::constants::{MessageType, WS_ERR_CODE_INTERNAL};
use benchlink_protocol::envelope::Message;
use benchlink_protocol::messages::{
    BmapRequest, BoolResponse, BytesWrittenResponse, CompressionRequest, CompressionResponse,
    ConsoleDataResponse, ConsoleLinesResponse, ConsoleSendRequest, FlushRequest, LockedResponse,
    SetTimeoutRequest, SetTimeoutResponse, StartResponse, StatusResponse, UptimeResponse,
    UsbClassRequest, UsbFindResponse, UsbPortRequest, UsbPortsResponse,
};

use crate::device::Device;
use crate::error::DeviceError;

/// Result payload of a request, `None` for an empty `result`.
type Reply = Result<Option<serde_json::Value>, DeviceError>;

pub struct AgentHandler {
    device: Arc<Device>,
}

impl AgentHandler {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// Runs a device operation on the blocking pool and answers with its
    /// outcome.
    async fn run(&self, sender: Sender, msg: Message, op: fn(&Device, &Message) -> Reply) {
        let device = Arc::clone(&self.device);
        let request = msg.clone();
        let reply = tokio::task::spawn_blocking(move || op(&device, &request))
            .await
            .unwrap_or_else(|e| Err(DeviceError::Internal(format!("request task failed: {e}"))));
        respond(&sender, &msg, reply);
    }
}

fn respond(sender: &Sender, msg: &Message, reply: Reply) {
    let reply = match reply {
        Ok(payload) => msg.reply(MessageType::Result, payload.as_ref()),
        Err(e) => {
            let code = e.code();
            if code == WS_ERR_CODE_INTERNAL {
                warn!(msg_type = ?msg.msg_type, "request failed: {e}");
            } else {
                debug!(msg_type = ?msg.msg_type, code, "request refused: {e}");
            }
            let _ = sender.send_error(msg, code, &e.to_string());
            return;
        }
    };
    match reply {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_INTERNAL, &e.to_string());
        }
    }
}

fn payload<T: Serialize>(value: T) -> Reply {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| DeviceError::Internal(e.to_string()))
}

fn unexpected(msg: &Message) -> DeviceError {
    DeviceError::BadRequest(format!("unexpected request type {:?}", msg.msg_type))
}

impl Handler for AgentHandler {
    fn on_client_connected(&self, _sender: Sender, meta: ClientMeta) -> HandlerFuture<'_> {
        Box::pin(async move {
            debug!(client = meta.id, remote = %meta.remote_addr, "client connected");
        })
    }

    fn on_client_disconnected(&self, meta: ClientMeta) -> HandlerFuture<'_> {
        Box::pin(async move {
            debug!(client = meta.id, remote = %meta.remote_addr, "client disconnected");
        })
    }

    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.device.session_check(msg.session.as_deref());
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_get_info(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let info = self.device.info(msg.session.as_deref());
            match msg.reply(MessageType::InfoResponse, Some(&info)) {
                Ok(reply) => {
                    let _ = sender.send_msg(reply);
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, WS_ERR_CODE_INTERNAL, &e.to_string());
                }
            }
        })
    }

    fn on_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.run(sender, msg, session))
    }

    fn on_target(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.run(sender, msg, target))
    }

    fn on_storage(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.run(sender, msg, storage))
    }

    fn on_usb(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.run(sender, msg, usb))
    }

    fn on_console(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.run(sender, msg, console))
    }
}

// ---------------------------------------------------------------------------
// Request groups
// ---------------------------------------------------------------------------

fn session(device: &Device, msg: &Message) -> Reply {
    let session = msg.session.as_deref();
    match msg.msg_type {
        MessageType::SessionCheck => {
            device.session_check(session);
            Ok(None)
        }
        MessageType::SessionLock => payload(BoolResponse {
            result: device.session_lock(session)?,
        }),
        MessageType::SessionLocked => payload(LockedResponse {
            holder: device.session_locked(session),
        }),
        MessageType::SessionUnlock => payload(BoolResponse {
            result: device.session_unlock(session)?,
        }),
        MessageType::SessionSetTimeout => {
            let req: SetTimeoutRequest = msg.require_payload()?;
            let previous =
                device.session_set_timeout(Duration::from_secs(req.timeout_secs), session);
            payload(SetTimeoutResponse {
                previous_secs: previous.as_secs(),
            })
        }
        _ => Err(unexpected(msg)),
    }
}

fn target(device: &Device, msg: &Message) -> Reply {
    let session = msg.session.as_deref();
    match msg.msg_type {
        MessageType::TargetOn => payload(BoolResponse {
            result: device.target_on(session)?,
        }),
        MessageType::TargetOff => payload(BoolResponse {
            result: device.target_off(session)?,
        }),
        MessageType::TargetToggle => payload(StatusResponse {
            status: device.target_toggle(session)?,
        }),
        MessageType::TargetStatus => payload(StatusResponse {
            status: device.target_status(session),
        }),
        MessageType::TargetUptime => payload(UptimeResponse {
            seconds: device.target_uptime(session).as_secs_f64(),
        }),
        MessageType::PowerLocked => payload(BoolResponse {
            result: device.power_locked(session),
        }),
        _ => Err(unexpected(msg)),
    }
}

fn storage(device: &Device, msg: &Message) -> Reply {
    let session = msg.session.as_deref();
    match msg.msg_type {
        MessageType::StorageOpen => payload(BoolResponse {
            result: device.storage_open(session)?,
        }),
        MessageType::StorageClose => payload(BoolResponse {
            result: device.storage_close(session)?,
        }),
        MessageType::StorageStatus => payload(device.storage_status(session)),
        MessageType::StorageToHost => payload(BoolResponse {
            result: device.storage_to_host(session)?,
        }),
        MessageType::StorageToTarget => payload(BoolResponse {
            result: device.storage_to_target(session)?,
        }),
        MessageType::StorageSwap => payload(StatusResponse {
            status: device.storage_swap(session)?,
        }),
        MessageType::StorageLocked => payload(BoolResponse {
            result: device.storage_locked(session),
        }),
        MessageType::StorageCompression => {
            let req: CompressionRequest = msg.require_payload()?;
            payload(CompressionResponse {
                previous: device.storage_compression(&req.compression, session)?,
            })
        }
        MessageType::StorageBmap => {
            let req: BmapRequest = msg.require_payload()?;
            device.storage_bmap(req.descriptor, session)?;
            Ok(None)
        }
        MessageType::StorageStart => payload(StartResponse {
            port: device.storage_start(session)?,
        }),
        MessageType::StorageFlush => {
            let req: FlushRequest = msg.require_payload()?;
            payload(BoolResponse {
                result: device.storage_flush(req.total, session),
            })
        }
        MessageType::StorageBytesWritten => payload(BytesWrittenResponse {
            written: device.storage_bytes_written(session),
        }),
        _ => Err(unexpected(msg)),
    }
}

fn usb(device: &Device, msg: &Message) -> Reply {
    let session = msg.session.as_deref();
    match msg.msg_type {
        MessageType::UsbPorts => payload(UsbPortsResponse {
            ports: device.usb_ports(session),
        }),
        MessageType::UsbOn => {
            let req: UsbPortRequest = msg.require_payload()?;
            payload(BoolResponse {
                result: device.usb_on(req.port, session)?,
            })
        }
        MessageType::UsbOff => {
            let req: UsbPortRequest = msg.require_payload()?;
            payload(BoolResponse {
                result: device.usb_off(req.port, session)?,
            })
        }
        MessageType::UsbToggle => {
            let req: UsbPortRequest = msg.require_payload()?;
            payload(StatusResponse {
                status: device.usb_toggle(req.port, session)?,
            })
        }
        MessageType::UsbStatus => {
            let req: UsbPortRequest = msg.require_payload()?;
            payload(StatusResponse {
                status: device.usb_status(req.port, session)?,
            })
        }
        MessageType::UsbFindByClass => {
            let req: UsbClassRequest = msg.require_payload()?;
            payload(UsbFindResponse {
                port: device.usb_find_by_class(&req.class, session),
            })
        }
        _ => Err(unexpected(msg)),
    }
}

fn console(device: &Device, msg: &Message) -> Reply {
    let session = msg.session.as_deref();
    match msg.msg_type {
        MessageType::ConsoleHead => payload(ConsoleDataResponse {
            data: device.console_head(session)?,
        }),
        MessageType::ConsoleLines => payload(ConsoleLinesResponse {
            lines: device.console_lines(session)?,
        }),
        MessageType::ConsoleTail => payload(ConsoleDataResponse {
            data: device.console_tail(session)?,
        }),
        MessageType::ConsoleDump => payload(ConsoleDataResponse {
            data: device.console_dump(session)?,
        }),
        MessageType::ConsoleClear => payload(ConsoleDataResponse {
            data: device.console_clear(session)?,
        }),
        MessageType::ConsoleSend => {
            let req: ConsoleSendRequest = msg.require_payload()?;
            device.console_send(&req.data, session)?;
            Ok(None)
        }
        _ => Err(unexpected(msg)),
    }
}
