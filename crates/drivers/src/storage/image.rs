//! Image file or block device on the host.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use benchlink_storage::{SeekSink, StorageSink};
use serde::Deserialize;
use tracing::{debug, info};

use super::{StorageController, StorageStatus};
use crate::DriverError;
use crate::registry::DriverSpec;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    file: PathBuf,
    /// Create the image file when it does not exist.
    #[serde(default)]
    create: bool,
}

/// Backing file handle shared by the file-based controllers.
pub(crate) struct ImageFile {
    path: PathBuf,
    create: bool,
    handle: Option<File>,
}

impl ImageFile {
    pub(crate) fn new(path: PathBuf, create: bool) -> Self {
        Self {
            path,
            create,
            handle: None,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn open(&mut self) -> Result<(), DriverError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(self.create)
            .truncate(false)
            .open(&self.path)?;
        self.handle = Some(file);
        info!(path = %self.path.display(), "storage opened");
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<(), DriverError> {
        if let Some(file) = self.handle.take() {
            file.sync_all()?;
            info!(path = %self.path.display(), "storage closed");
        }
        Ok(())
    }

    pub(crate) fn sink(&mut self) -> Result<Box<dyn StorageSink>, DriverError> {
        let file = self.handle.as_ref().ok_or(DriverError::NotOpen)?;
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        debug!(path = %self.path.display(), "storage sink created");
        Ok(Box::new(SeekSink::new(file)?))
    }
}

/// Storage that only ever lives on the host: a disk image that the target
/// reaches by other means, or a block device on a manual switch.
pub struct ImageStorage {
    file: ImageFile,
}

impl ImageStorage {
    pub fn from_spec(spec: &DriverSpec) -> Result<Self, DriverError> {
        let opts: Options = spec.options("storage")?;
        Ok(Self {
            file: ImageFile::new(opts.file, opts.create),
        })
    }
}

impl StorageController for ImageStorage {
    fn open(&mut self) -> Result<(), DriverError> {
        self.file.open()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.file.close()
    }

    fn is_open(&self) -> bool {
        self.file.is_open()
    }

    fn status(&self) -> StorageStatus {
        StorageStatus::Host
    }

    fn to_host(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn to_target(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("moving image storage to the target"))
    }

    fn supports_hotplug(&self) -> bool {
        false
    }

    fn sink(&mut self) -> Result<Box<dyn StorageSink>, DriverError> {
        self.file.sink()
    }
}
