//! Storage exposed to the target as a USB mass-storage gadget function.
//!
//! The backing file is bound to the gadget's LUN while on the target and
//! unbound (empty LUN) while on the host.

use std::fs;
use std::path::PathBuf;

use benchlink_storage::StorageSink;
use serde::Deserialize;
use tracing::info;

use super::image::ImageFile;
use super::{StorageController, StorageStatus};
use crate::registry::DriverSpec;
use crate::{DriverError, GadgetContext};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    file: PathBuf,
    #[serde(default)]
    create: bool,
}

pub struct UsbfStorage {
    file: ImageFile,
    /// LUN backing-file attribute of the gadget function.
    lun_file: PathBuf,
    mode: StorageStatus,
}

impl UsbfStorage {
    /// Registers the mass-storage function in `gadget`.
    pub fn from_spec(spec: &DriverSpec, gadget: &mut GadgetContext) -> Result<Self, DriverError> {
        let opts: Options = spec.options("storage")?;
        let lun_file = gadget.add_mass_storage()?;
        Ok(Self {
            file: ImageFile::new(opts.file, opts.create),
            lun_file,
            mode: StorageStatus::Host,
        })
    }

    fn bind(&self, backing: &str) -> Result<(), DriverError> {
        fs::write(&self.lun_file, backing).map_err(|e| {
            DriverError::Gadget(format!("{}: {e}", self.lun_file.display()))
        })
    }
}

impl StorageController for UsbfStorage {
    fn open(&mut self) -> Result<(), DriverError> {
        if self.mode == StorageStatus::Target {
            return Err(DriverError::OnTarget);
        }
        self.file.open()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.file.close()
    }

    fn is_open(&self) -> bool {
        self.file.is_open()
    }

    fn status(&self) -> StorageStatus {
        self.mode
    }

    fn to_host(&mut self) -> Result<(), DriverError> {
        if self.mode == StorageStatus::Host {
            return Ok(());
        }
        self.bind("")?;
        self.mode = StorageStatus::Host;
        info!("storage attached to host");
        Ok(())
    }

    fn to_target(&mut self) -> Result<(), DriverError> {
        self.file.close()?;
        let backing = self.file.path().display().to_string();
        self.bind(&backing)?;
        self.mode = StorageStatus::Target;
        info!(file = %backing, "storage attached to target");
        Ok(())
    }

    fn supports_hotplug(&self) -> bool {
        true
    }

    fn sink(&mut self) -> Result<Box<dyn StorageSink>, DriverError> {
        if self.mode == StorageStatus::Target {
            return Err(DriverError::OnTarget);
        }
        self.file.sink()
    }
}
