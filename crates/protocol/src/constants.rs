use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead. Long enough to cover a client that is
/// busy streaming an image over the data channel.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (4 MB).
///
/// Image data never travels over the WebSocket, only control messages and
/// console dumps.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Timeout for request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP port of the agent's WebSocket endpoint.
pub const DEFAULT_AGENT_PORT: u16 = 5556;

/// Prefix of session manager events republished on the event channel.
pub const EVENT_SESSION: &str = "SESSION";
/// Prefix of power state change events.
pub const EVENT_POWER: &str = "POWER";
/// Prefix of shared storage events.
pub const EVENT_STORAGE: &str = "STORAGE";

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Connection management
    Ping,
    GetInfo,

    // Session and lock arbitration
    SessionCheck,
    SessionLock,
    SessionLocked,
    SessionUnlock,
    SessionSetTimeout,

    // Target power
    TargetOn,
    TargetOff,
    TargetToggle,
    TargetStatus,
    TargetUptime,
    PowerLocked,

    // Shared storage
    StorageOpen,
    StorageClose,
    StorageStatus,
    StorageToHost,
    StorageToTarget,
    StorageSwap,
    StorageLocked,
    StorageCompression,
    StorageBmap,
    StorageStart,
    StorageFlush,
    StorageBytesWritten,

    // USB switches
    UsbPorts,
    UsbOn,
    UsbOff,
    UsbToggle,
    UsbStatus,
    UsbFindByClass,

    // Console
    ConsoleHead,
    ConsoleLines,
    ConsoleTail,
    ConsoleDump,
    ConsoleClear,
    ConsoleSend,

    // Responses from Agent to client
    Pong,
    InfoResponse,
    Result,
    Error,

    // Push notifications from Agent to every client
    Event,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Coarse routing of request types to handler entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestGroup {
    Session,
    Target,
    Storage,
    Usb,
    Console,
}

impl MessageType {
    /// Returns the handler group a request belongs to, or `None` for
    /// connection-level, response and event types.
    pub fn group(self) -> Option<RequestGroup> {
        use MessageType::*;
        match self {
            SessionCheck | SessionLock | SessionLocked | SessionUnlock | SessionSetTimeout => {
                Some(RequestGroup::Session)
            }
            TargetOn | TargetOff | TargetToggle | TargetStatus | TargetUptime | PowerLocked => {
                Some(RequestGroup::Target)
            }
            StorageOpen | StorageClose | StorageStatus | StorageToHost | StorageToTarget
            | StorageSwap | StorageLocked | StorageCompression | StorageBmap | StorageStart
            | StorageFlush | StorageBytesWritten => Some(RequestGroup::Storage),
            UsbPorts | UsbOn | UsbOff | UsbToggle | UsbStatus | UsbFindByClass => {
                Some(RequestGroup::Usb)
            }
            ConsoleHead | ConsoleLines | ConsoleTail | ConsoleDump | ConsoleClear
            | ConsoleSend => Some(RequestGroup::Console),
            Ping | GetInfo | Pong | InfoResponse | Result | Error | Event | Unknown => None,
        }
    }
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_LOCKED: i32 = 423;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const WS_ERR_CODE_UNAVAILABLE: i32 = 503;
