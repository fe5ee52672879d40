//! Switchable USB ports.

pub mod gpio;

use std::fmt;

use crate::DriverError;

pub use gpio::GpioUsbSwitch;

/// Power state of a USB port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStatus {
    On,
    Off,
    Unknown,
}

impl UsbStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UsbStatus::On => "ON",
            UsbStatus::Off => "OFF",
            UsbStatus::Unknown => "???",
        }
    }
}

impl fmt::Display for UsbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A USB port whose power can be switched.
pub trait UsbSwitch: Send {
    fn on(&mut self) -> Result<bool, DriverError>;

    fn off(&mut self) -> Result<bool, DriverError>;

    fn status(&mut self) -> UsbStatus;

    /// Flips the port and returns the new state.
    fn toggle(&mut self) -> Result<UsbStatus, DriverError> {
        if self.status() == UsbStatus::On {
            self.off()?;
        } else {
            self.on()?;
        }
        Ok(self.status())
    }

    /// Device class plugged into the port (e.g. `"keyboard"`), used for
    /// lookups by class.
    fn class_name(&self) -> &str;
}
