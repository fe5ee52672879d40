//! Agent configuration.
//!
//! Reads TOML from `--config <path>` or `~/.config/benchlink/agent.toml`.
//! A missing file is created with the defaults so it can be edited in
//! place.
//!
//! ```toml
//! name = "bench-1"
//! port = 5556
//!
//! [timeouts]
//! lock = 5        # minutes
//! session = 5     # minutes
//! power = 3600    # seconds without sessions before auto power-off, 0 = never
//!
//! [power]
//! variant = "gpio"
//! pins = [203]
//!
//! [storage]
//! variant = "usbf"
//! file = "/var/lib/benchlink/sd.img"
//!
//! [[usb]]
//! variant = "gpio"
//! class = "keyboard"
//! pin = 201
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use benchlink_drivers::{DriverSpec, GadgetConfig};
use benchlink_protocol::constants::DEFAULT_AGENT_PORT;
use benchlink_storage::{
    DEFAULT_CHUNK_SIZE, DEFAULT_HIGH_WATER_MARK, DEFAULT_RECV_TIMEOUT, WriterConfig,
};

/// Agent configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub writer: WriterSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<DriverSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<DriverSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<DriverSpec>,
    /// USB ports, numbered from 1 in file order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usb: Vec<DriverSpec>,
    #[serde(default)]
    pub gadget: GadgetConfig,
}

/// `[timeouts]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Lock lease, in minutes.
    #[serde(default = "default_lock_minutes")]
    pub lock: u64,
    /// Session timeout, in minutes.
    #[serde(default = "default_session_minutes")]
    pub session: u64,
    /// Idle delay before the target is powered off, in seconds.
    #[serde(default = "default_power_seconds")]
    pub power: u64,
}

/// `[writer]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterSettings {
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
    /// Bytes queued between the data channel and the writer.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "benchlink".into())
}

fn default_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_lock_minutes() -> u64 {
    5
}

fn default_session_minutes() -> u64 {
    5
}

fn default_power_seconds() -> u64 {
    60 * 60
}

fn default_recv_timeout_secs() -> u64 {
    DEFAULT_RECV_TIMEOUT.as_secs()
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            lock: default_lock_minutes(),
            session: default_session_minutes(),
            power: default_power_seconds(),
        }
    }
}

impl Timeouts {
    pub fn lock(&self) -> Duration {
        Duration::from_secs(self.lock * 60)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session * 60)
    }

    /// `None` when auto power-off is disabled.
    pub fn power(&self) -> Option<Duration> {
        (self.power > 0).then(|| Duration::from_secs(self.power))
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            recv_timeout_secs: default_recv_timeout_secs(),
            high_water_mark: default_high_water_mark(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl WriterSettings {
    pub fn to_writer_config(&self) -> WriterConfig {
        WriterConfig {
            recv_timeout: Duration::from_secs(self.recv_timeout_secs.max(1)),
            high_water_mark: self.high_water_mark,
            chunk_size: self.chunk_size.max(1),
            ..Default::default()
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            timeouts: Timeouts::default(),
            writer: WriterSettings::default(),
            power: None,
            console: None,
            storage: None,
            usb: Vec::new(),
            gadget: GadgetConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parses a configuration document.
    pub fn parse(source: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Loads the file at `path`, creating it with defaults when missing.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config = Self::parse(&content)
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            return Ok(config);
        }

        let config = Self::default();
        config.save(path)?;
        tracing::info!(path = %path.display(), "created default configuration");
        Ok(config)
    }

    /// Writes the configuration to `path` (mode 0600).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        set_permissions_0600(path);
        Ok(())
    }
}

/// Picks the configuration path: `--config <path>` or the per-user default.
pub fn config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set, pass --config")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("benchlink")
        .join("agent.toml"))
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AgentConfig::parse("").unwrap();
        assert_eq!(config.port, DEFAULT_AGENT_PORT);
        assert_eq!(config.timeouts.lock(), Duration::from_secs(300));
        assert_eq!(config.timeouts.power(), Some(Duration::from_secs(3600)));
        assert!(config.power.is_none());
        assert!(config.usb.is_empty());
        assert_eq!(config.writer.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn drivers_keep_their_options() {
        let config = AgentConfig::parse(
            r#"
            name = "bench-7"

            [timeouts]
            lock = 10
            power = 0

            [power]
            variant = "shellcmd"
            on-cmd = "relay 1 on"
            off-cmd = "relay 1 off"

            [[usb]]
            variant = "gpio"
            class = "keyboard"
            pin = 201

            [[usb]]
            variant = "gpio"
            class = "storage"
            pin = 202
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "bench-7");
        assert_eq!(config.timeouts.lock(), Duration::from_secs(600));
        assert_eq!(config.timeouts.session(), Duration::from_secs(300));
        assert_eq!(config.timeouts.power(), None);

        let power = config.power.unwrap();
        assert_eq!(power.variant, "shellcmd");
        assert_eq!(power.options["on-cmd"].as_str(), Some("relay 1 on"));

        assert_eq!(config.usb.len(), 2);
        assert_eq!(config.usb[1].options["class"].as_str(), Some("storage"));
    }

    #[test]
    fn writer_settings_map_to_writer_config() {
        let settings = WriterSettings {
            recv_timeout_secs: 0,
            high_water_mark: 4096,
            chunk_size: 1024,
        };
        let config = settings.to_writer_config();
        assert_eq!(config.recv_timeout, Duration::from_secs(1));
        assert_eq!(config.queue_depth(), 4);
        assert_eq!(config.port, 0);
    }

    #[test]
    fn missing_file_is_created_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.toml");

        let created = AgentConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = AgentConfig::load_or_create(&path).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        let err = AgentConfig::load_or_create(&path).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn config_path_from_arguments() {
        let args = vec!["--config".to_string(), "/etc/benchlink.toml".to_string()];
        assert_eq!(
            config_path(&args).unwrap(),
            PathBuf::from("/etc/benchlink.toml")
        );
        let args = vec!["--config=/tmp/a.toml".to_string()];
        assert_eq!(config_path(&args).unwrap(), PathBuf::from("/tmp/a.toml"));
        assert!(config_path(&["--config".to_string()]).is_err());
    }
}
