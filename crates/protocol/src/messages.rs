use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Changes the session timeout (`session_set_timeout`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTimeoutRequest {
    pub timeout_secs: u64,
}

/// Selects the image codec (`storage_compression`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRequest {
    pub compression: String,
}

/// Attaches (or clears) a block-map descriptor (`storage_bmap`).
///
/// The descriptor is passed through untouched; the agent validates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmapRequest {
    #[serde(default)]
    pub descriptor: Option<serde_json::Value>,
}

/// Declares the final size of the image stream (`storage_flush`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushRequest {
    pub total: u64,
}

/// Addresses a single USB port, 1-based (`usb_on`, `usb_off`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbPortRequest {
    pub port: usize,
}

/// Looks up a USB port by device class (`usb_find_by_class`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbClassRequest {
    pub class: String,
}

/// Sends input to the target console (`console_send`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleSendRequest {
    pub data: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Agent identity and attached drivers (`get_info`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    pub usb_ports: usize,
}

/// Generic boolean outcome (lock, unlock, power and storage switches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolResponse {
    pub result: bool,
}

/// Current lock holder (`session_locked`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedResponse {
    #[serde(default)]
    pub holder: Option<String>,
}

/// Previous session timeout (`session_set_timeout`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTimeoutResponse {
    pub previous_secs: u64,
}

/// Plain status string (`target_status`, `target_toggle`, `usb_status`,
/// `storage_swap`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Seconds since the target was last powered on (`target_uptime`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeResponse {
    pub seconds: f64,
}

/// Shared storage state (`storage_status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStatusResponse {
    pub status: String,
    pub writing: bool,
    pub written: u64,
    pub failed: bool,
}

/// Previously selected codec (`storage_compression`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionResponse {
    pub previous: String,
}

/// Data channel endpoint for the image stream (`storage_start`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub port: u16,
}

/// Bytes committed to shared storage (`storage_bytes_written`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytesWrittenResponse {
    pub written: u64,
}

/// Number of USB ports (`usb_ports`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbPortsResponse {
    pub ports: usize,
}

/// Port matching a device class (`usb_find_by_class`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbFindResponse {
    #[serde(default)]
    pub port: Option<usize>,
}

/// Console text (`console_head`, `console_tail`, `console_dump`,
/// `console_clear`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleDataResponse {
    #[serde(default)]
    pub data: Option<String>,
}

/// Number of buffered console lines (`console_lines`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLinesResponse {
    pub lines: usize,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A push notification, e.g. `"SESSION LOCKED alice"` or `"POWER ON"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_timeout_uses_camel_case() {
        let req = SetTimeoutRequest { timeout_secs: 90 };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"timeoutSecs":90}"#);
    }

    #[test]
    fn locked_response_without_holder() {
        let parsed: LockedResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.holder.is_none());
    }

    #[test]
    fn bmap_request_carries_raw_descriptor() {
        let json = r#"{"descriptor":{"BlockSize":512,"BlockMap":[]}}"#;
        let req: BmapRequest = serde_json::from_str(json).unwrap();
        let desc = req.descriptor.unwrap();
        assert_eq!(desc["BlockSize"], 512);
    }

    #[test]
    fn info_response_skips_missing_drivers() {
        let info = InfoResponse {
            name: "bench-1".into(),
            version: "0.1.0".into(),
            power: Some("gpio".into()),
            console: None,
            storage: None,
            usb_ports: 2,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"power\":\"gpio\""));
        assert!(!json.contains("console"));
        assert!(json.contains("\"usbPorts\":2"));
    }
}
