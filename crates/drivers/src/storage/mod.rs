//! Shared storage switched between this host and the target.

pub mod image;
pub mod usbf;

use std::fmt;

use benchlink_storage::StorageSink;

use crate::DriverError;

pub use image::ImageStorage;
pub use usbf::UsbfStorage;

/// Which side the shared storage is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    Host,
    Target,
    Unknown,
}

impl StorageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageStatus::Host => "HOST",
            StorageStatus::Target => "TARGET",
            StorageStatus::Unknown => "???",
        }
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controls the shared storage device.
pub trait StorageController: Send {
    /// Opens the device for writing from the host.
    fn open(&mut self) -> Result<(), DriverError>;

    /// Closes the device and syncs it to stable storage.
    fn close(&mut self) -> Result<(), DriverError>;

    fn is_open(&self) -> bool;

    fn status(&self) -> StorageStatus;

    /// Attaches the storage to this host.
    fn to_host(&mut self) -> Result<(), DriverError>;

    /// Attaches the storage to the target. Closes it on the host first.
    fn to_target(&mut self) -> Result<(), DriverError>;

    /// Whether the storage can move while the target is powered.
    fn supports_hotplug(&self) -> bool;

    /// A sink writing from the start of the opened device.
    fn sink(&mut self) -> Result<Box<dyn StorageSink>, DriverError>;
}
