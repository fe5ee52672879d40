//! Device capabilities of a test bench.
//!
//! Every capability is a trait with one implementation per backend:
//! - [`PowerController`]: target power (`gpio`, `shellcmd`)
//! - [`ConsoleInterface`]: target console (`tcp`), buffered by [`ConsoleLogger`]
//! - [`StorageController`]: shared storage (`image`, `usbf`)
//! - [`UsbSwitch`]: switchable USB ports (`gpio`)
//!
//! Backends are selected by variant name through the [`Registry`], once,
//! at startup. USB gadget functions are collected in an explicit
//! [`GadgetContext`] that the caller owns.

pub mod console;
pub mod error;
pub mod gadget;
pub mod gpio;
pub mod power;
pub mod registry;
pub mod storage;
pub mod usb;

pub use console::{ConsoleInterface, ConsoleLogger};
pub use error::DriverError;
pub use gadget::{GadgetConfig, GadgetContext};
pub use power::{PowerController, PowerStatus};
pub use registry::{DriverSpec, Registry};
pub use storage::{StorageController, StorageStatus};
pub use usb::{UsbStatus, UsbSwitch};
