//! USB port enable line on a sysfs GPIO.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use super::{UsbStatus, UsbSwitch};
use crate::DriverError;
use crate::gpio::{DEFAULT_GPIO_ROOT, GpioLine};
use crate::registry::DriverSpec;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Options {
    pin: u32,
    #[serde(default)]
    class: String,
    /// The port is enabled by driving the line low.
    #[serde(default)]
    active_low: bool,
    #[serde(default = "default_root")]
    root: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_GPIO_ROOT)
}

pub struct GpioUsbSwitch {
    line: GpioLine,
    class: String,
    active_low: bool,
}

impl GpioUsbSwitch {
    pub fn from_spec(spec: &DriverSpec) -> Result<Self, DriverError> {
        let opts: Options = spec.options("usb")?;
        Ok(Self {
            line: GpioLine::output(&opts.root, opts.pin)?,
            class: opts.class,
            active_low: opts.active_low,
        })
    }

    fn drive(&mut self, enable: bool) -> Result<UsbStatus, DriverError> {
        self.line.set(enable != self.active_low)?;
        Ok(self.status())
    }
}

impl UsbSwitch for GpioUsbSwitch {
    fn on(&mut self) -> Result<bool, DriverError> {
        Ok(self.drive(true)? == UsbStatus::On)
    }

    fn off(&mut self) -> Result<bool, DriverError> {
        Ok(self.drive(false)? == UsbStatus::Off)
    }

    fn status(&mut self) -> UsbStatus {
        match self.line.get() {
            Ok(high) if high != self.active_low => UsbStatus::On,
            Ok(_) => UsbStatus::Off,
            Err(e) => {
                warn!(pin = self.line.pin(), "usb switch read failed: {e}");
                UsbStatus::Unknown
            }
        }
    }

    fn class_name(&self) -> &str {
        &self.class
    }
}
