//! Variant name → backend factory.
//!
//! The agent resolves each configured capability once at startup; the
//! resulting trait objects are used for the rest of the process.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::console::{ConsoleInterface, TcpConsole};
use crate::power::{GpioPower, PowerController, ShellCmdPower};
use crate::storage::{ImageStorage, StorageController, UsbfStorage};
use crate::usb::{GpioUsbSwitch, UsbSwitch};
use crate::{DriverError, GadgetContext};

/// A configured driver: its variant name plus backend options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverSpec {
    pub variant: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl DriverSpec {
    pub fn new(variant: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            options: toml::Table::new(),
        }
    }

    /// Parses a spec from a TOML table body.
    pub fn parse(source: &str) -> Result<Self, DriverError> {
        toml::from_str(source).map_err(|e| DriverError::config("driver", e.to_string()))
    }

    /// Deserializes the backend options.
    pub(crate) fn options<T: DeserializeOwned>(&self, kind: &'static str) -> Result<T, DriverError> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e: toml::de::Error| {
                DriverError::config(kind, format!("{}: {}", self.variant, e.message()))
            })
    }
}

pub type PowerFactory = fn(&DriverSpec) -> Result<Box<dyn PowerController>, DriverError>;
pub type ConsoleFactory = fn(&DriverSpec) -> Result<Box<dyn ConsoleInterface>, DriverError>;
pub type StorageFactory =
    fn(&DriverSpec, &mut GadgetContext) -> Result<Box<dyn StorageController>, DriverError>;
pub type UsbFactory = fn(&DriverSpec) -> Result<Box<dyn UsbSwitch>, DriverError>;

/// Known backends per capability.
pub struct Registry {
    power: HashMap<&'static str, PowerFactory>,
    console: HashMap<&'static str, ConsoleFactory>,
    storage: HashMap<&'static str, StorageFactory>,
    usb: HashMap<&'static str, UsbFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            power: HashMap::new(),
            console: HashMap::new(),
            storage: HashMap::new(),
            usb: HashMap::new(),
        }
    }

    /// The registry of all backends shipped with this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_power("gpio", |spec| Ok(Box::new(GpioPower::from_spec(spec)?)));
        registry.register_power("shellcmd", |spec| {
            Ok(Box::new(ShellCmdPower::from_spec(spec)?))
        });
        registry.register_console("tcp", |spec| Ok(Box::new(TcpConsole::from_spec(spec)?)));
        registry.register_storage("image", |spec, _| {
            Ok(Box::new(ImageStorage::from_spec(spec)?))
        });
        registry.register_storage("usbf", |spec, gadget| {
            Ok(Box::new(UsbfStorage::from_spec(spec, gadget)?))
        });
        registry.register_usb("gpio", |spec| Ok(Box::new(GpioUsbSwitch::from_spec(spec)?)));
        registry
    }

    pub fn register_power(&mut self, variant: &'static str, factory: PowerFactory) {
        self.power.insert(variant, factory);
    }

    pub fn register_console(&mut self, variant: &'static str, factory: ConsoleFactory) {
        self.console.insert(variant, factory);
    }

    pub fn register_storage(&mut self, variant: &'static str, factory: StorageFactory) {
        self.storage.insert(variant, factory);
    }

    pub fn register_usb(&mut self, variant: &'static str, factory: UsbFactory) {
        self.usb.insert(variant, factory);
    }

    pub fn power(&self, spec: &DriverSpec) -> Result<Box<dyn PowerController>, DriverError> {
        let factory = lookup(&self.power, "power", spec)?;
        factory(spec)
    }

    pub fn console(&self, spec: &DriverSpec) -> Result<Box<dyn ConsoleInterface>, DriverError> {
        let factory = lookup(&self.console, "console", spec)?;
        factory(spec)
    }

    pub fn storage(
        &self,
        spec: &DriverSpec,
        gadget: &mut GadgetContext,
    ) -> Result<Box<dyn StorageController>, DriverError> {
        let factory = lookup(&self.storage, "storage", spec)?;
        factory(spec, gadget)
    }

    pub fn usb(&self, spec: &DriverSpec) -> Result<Box<dyn UsbSwitch>, DriverError> {
        let factory = lookup(&self.usb, "usb", spec)?;
        factory(spec)
    }
}

fn lookup<F: Copy>(
    table: &HashMap<&'static str, F>,
    kind: &'static str,
    spec: &DriverSpec,
) -> Result<F, DriverError> {
    let factory = table
        .get(spec.variant.as_str())
        .copied()
        .ok_or_else(|| DriverError::UnknownVariant {
            kind,
            variant: spec.variant.clone(),
        })?;
    info!(kind, variant = %spec.variant, "driver selected");
    Ok(factory)
}
