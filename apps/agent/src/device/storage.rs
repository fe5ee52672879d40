//! Shared storage and image writes.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use benchlink_drivers::{DriverError, PowerStatus, StorageController, StorageStatus};
use benchlink_protocol::constants::EVENT_STORAGE;
use benchlink_protocol::messages::StorageStatusResponse;
use benchlink_storage::{BlockMap, Compression, ImageWriter};

use super::{Device, lock};
use crate::error::DeviceError;

impl Device {
    /// Opens the storage on the host for writing.
    pub fn storage_open(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        let storage = self.storage_driver()?;
        self.require_unlocked(session)?;

        self.writer().stop();
        let mut storage = lock(storage);
        storage.open()?;
        Ok(storage.is_open())
    }

    /// Stops any transfer and closes the storage.
    pub fn storage_close(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        let storage = self.storage_driver()?;
        self.require_unlocked(session)?;

        self.writer().stop();
        let mut storage = lock(storage);
        storage.close()?;
        Ok(!storage.is_open())
    }

    pub fn storage_status(&self, session: Option<&str>) -> StorageStatusResponse {
        self.sessions.check(session);
        let status = self
            .storage
            .as_ref()
            .map_or(StorageStatus::Unknown, |s| lock(s).status());
        let writer = self.writer();
        StorageStatusResponse {
            status: status.as_str().into(),
            writing: writer.writing(),
            written: writer.written(),
            failed: writer.failed(),
        }
    }

    /// Whether the storage may not move between host and target.
    pub fn storage_locked(&self, session: Option<&str>) -> bool {
        self.sessions.check(session);
        if self.locked_by_other(session) {
            return true;
        }
        let Some(storage) = &self.storage else {
            debug!("storage locked: no storage driver");
            return true;
        };
        let (hotplug, open) = {
            let storage = lock(storage);
            (storage.supports_hotplug(), storage.is_open())
        };
        if hotplug {
            return open;
        }
        if self.power.is_none() {
            debug!("storage locked: no power driver");
            return true;
        }
        if self.power_status() != PowerStatus::Off {
            debug!("storage locked: target is not off");
            return true;
        }
        open
    }

    /// Attaches the storage to the host. `false` while it is locked.
    pub fn storage_to_host(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        if self.storage_locked(session) {
            return Ok(false);
        }
        let storage = self.storage_driver()?;
        lock(storage).to_host()?;
        self.storage_changed(StorageStatus::Host);
        Ok(true)
    }

    /// Closes the storage and attaches it to the target. `false` while it
    /// is locked.
    pub fn storage_to_target(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        if self.storage_locked(session) {
            return Ok(false);
        }
        let storage = self.storage_driver()?;
        self.writer().stop();
        {
            let mut storage = lock(storage);
            storage.close()?;
            storage.to_target()?;
        }
        self.storage_changed(StorageStatus::Target);
        Ok(true)
    }

    /// Moves the storage to the other side and returns where it is now.
    pub fn storage_swap(&self, session: Option<&str>) -> Result<String, DeviceError> {
        self.sessions.check(session);
        if !self.storage_locked(session) {
            let storage = self.storage_driver()?;
            let status = lock(storage).status();
            match status {
                StorageStatus::Host => {
                    lock(storage).to_target()?;
                    self.storage_changed(StorageStatus::Target);
                }
                StorageStatus::Target => {
                    lock(storage).to_host()?;
                    self.storage_changed(StorageStatus::Host);
                }
                StorageStatus::Unknown => {}
            }
        }
        Ok(self.storage_status(session).status)
    }

    /// Selects the codec of the next transfer and returns the previous one.
    pub fn storage_compression(
        &self,
        compression: &str,
        session: Option<&str>,
    ) -> Result<String, DeviceError> {
        self.sessions.check(session);
        self.storage_driver()?;
        let compression: Compression = compression.parse()?;
        let previous = self.writer().set_compression(compression);
        Ok(previous.as_str().into())
    }

    /// Attaches a block map to the next transfer, or clears it.
    pub fn storage_bmap(
        &self,
        descriptor: Option<serde_json::Value>,
        session: Option<&str>,
    ) -> Result<(), DeviceError> {
        self.sessions.check(session);
        self.storage_driver()?;
        let bmap = descriptor.map(BlockMap::from_value).transpose()?;
        self.writer().set_bmap(bmap)?;
        Ok(())
    }

    /// Starts receiving an image into the opened storage and returns the
    /// data channel port.
    pub fn storage_start(&self, session: Option<&str>) -> Result<u16, DeviceError> {
        self.sessions.check(session);
        let storage = self.storage_driver()?;
        self.require_unlocked(session)?;

        let sink = {
            let mut storage = lock(storage);
            if !storage.is_open() {
                return Err(DriverError::NotOpen.into());
            }
            storage.sink()?
        };
        let port = self.writer().start(sink, session)?;
        info!(port, session = session.unwrap_or("-"), "image transfer ready");
        Ok(port)
    }

    /// Declares the size of the image stream. `false` when no transfer
    /// was started.
    pub fn storage_flush(&self, total: u64, session: Option<&str>) -> bool {
        self.sessions.check(session);
        let writer = self.writer();
        if writer.port().is_none() {
            warn!(total, "flush without a transfer");
            return false;
        }
        writer.flush(total);
        true
    }

    pub fn storage_bytes_written(&self, session: Option<&str>) -> u64 {
        self.sessions.check(session);
        self.writer().written()
    }

    fn storage_driver(&self) -> Result<&Mutex<Box<dyn StorageController>>, DeviceError> {
        self.storage.as_ref().ok_or(DeviceError::NoDriver("storage"))
    }

    fn writer(&self) -> MutexGuard<'_, ImageWriter> {
        lock(&self.writer)
    }

    fn storage_changed(&self, status: StorageStatus) {
        info!(%status, "storage moved");
        self.events.emit(EVENT_STORAGE, status);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::path::Path;
    use std::time::{Duration, Instant};

    use benchlink_agent_server::Broadcaster;
    use benchlink_drivers::DriverSpec;
    use benchlink_drivers::storage::ImageStorage;

    use super::super::testing::*;
    use super::*;

    fn image_storage(path: &Path) -> Box<dyn StorageController> {
        let spec = DriverSpec::parse(&format!(
            "variant = \"image\"\nfile = {:?}\ncreate = true",
            path.display().to_string()
        ))
        .unwrap();
        Box::new(ImageStorage::from_spec(&spec).unwrap())
    }

    /// Storage that can move to the target, without hotplug.
    #[derive(Default)]
    struct SwitchedStorage {
        open: bool,
        status: Option<StorageStatus>,
    }

    impl StorageController for SwitchedStorage {
        fn open(&mut self) -> Result<(), DriverError> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) -> Result<(), DriverError> {
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn status(&self) -> StorageStatus {
            self.status.unwrap_or(StorageStatus::Host)
        }

        fn to_host(&mut self) -> Result<(), DriverError> {
            self.status = Some(StorageStatus::Host);
            Ok(())
        }

        fn to_target(&mut self) -> Result<(), DriverError> {
            self.open = false;
            self.status = Some(StorageStatus::Target);
            Ok(())
        }

        fn supports_hotplug(&self) -> bool {
            false
        }

        fn sink(&mut self) -> Result<Box<dyn benchlink_storage::StorageSink>, DriverError> {
            Err(DriverError::Unsupported("writing to a switched test storage"))
        }
    }

    fn wait_until(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !what() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn locked_without_drivers() {
        let device = device(None, None, None, Vec::new(), Broadcaster::new());
        assert!(device.storage_locked(None));
        assert!(!device.storage_to_host(None).unwrap());
        assert_eq!(device.storage_swap(None).unwrap(), "???");
        assert!(matches!(
            device.storage_open(None),
            Err(DeviceError::NoDriver("storage"))
        ));
        assert_eq!(device.storage_status(None).status, "???");
    }

    #[test]
    fn locked_unless_target_is_off_and_storage_closed() {
        let power = FakePower::default();
        *power.state.lock().unwrap() = Some(true);
        let device = device(
            Some(power),
            None,
            Some(Box::new(SwitchedStorage::default())),
            Vec::new(),
            Broadcaster::new(),
        );

        assert!(device.storage_locked(None), "target is on");
        device.target_off(None).unwrap();
        assert!(!device.storage_locked(None));

        assert!(device.storage_open(None).unwrap());
        assert!(device.storage_locked(None), "storage is open");
        assert!(device.storage_close(None).unwrap());

        assert!(device.session_lock(Some("alice")).unwrap());
        assert!(device.storage_locked(Some("bob")));
        assert!(!device.storage_locked(Some("alice")));
        assert!(matches!(
            device.storage_open(Some("bob")),
            Err(DeviceError::Locked)
        ));
    }

    #[test]
    fn swap_moves_between_host_and_target() {
        let power = FakePower::default();
        *power.state.lock().unwrap() = Some(false);
        let device = device(
            Some(power),
            None,
            Some(Box::new(SwitchedStorage::default())),
            Vec::new(),
            Broadcaster::new(),
        );

        assert_eq!(device.storage_swap(None).unwrap(), "TARGET");
        assert_eq!(device.storage_swap(None).unwrap(), "HOST");
        assert!(device.storage_to_target(None).unwrap());
        assert_eq!(device.storage_status(None).status, "TARGET");
        assert!(device.storage_to_host(None).unwrap());
        assert_eq!(device.storage_status(None).status, "HOST");
    }

    #[test]
    fn hotplug_storage_ignores_power() {
        let root = tempfile::tempdir().unwrap();
        let mut gadget = benchlink_drivers::GadgetContext::new(benchlink_drivers::GadgetConfig {
            configfs: root.path().join("usb_gadget"),
            name: "bench".into(),
            ..Default::default()
        });
        let spec = DriverSpec::parse(&format!(
            "variant = \"usbf\"\nfile = {:?}\ncreate = true",
            root.path().join("sd.img").display().to_string()
        ))
        .unwrap();
        let storage = benchlink_drivers::storage::UsbfStorage::from_spec(&spec, &mut gadget).unwrap();
        let device = device(None, None, Some(Box::new(storage)), Vec::new(), Broadcaster::new());

        assert!(!device.storage_locked(None));
        assert!(device.storage_open(None).unwrap());
        assert!(device.storage_locked(None));
    }

    #[test]
    fn compression_and_bmap_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(
            None,
            None,
            Some(image_storage(&dir.path().join("sd.img"))),
            Vec::new(),
            Broadcaster::new(),
        );

        assert_eq!(device.storage_compression("zstd", None).unwrap(), "raw");
        assert_eq!(device.storage_compression("gz", None).unwrap(), "zstd");
        let err = device.storage_compression("lz4", None).unwrap_err();
        assert_eq!(err.code(), 400);

        let err = device
            .storage_bmap(Some(serde_json::json!({"BlockSize": 0})), None)
            .unwrap_err();
        assert_eq!(err.code(), 400);
        device.storage_bmap(None, None).unwrap();
    }

    #[test]
    fn start_requires_open_storage() {
        let dir = tempfile::tempdir().unwrap();
        let device = device(
            None,
            None,
            Some(image_storage(&dir.path().join("sd.img"))),
            Vec::new(),
            Broadcaster::new(),
        );
        assert!(matches!(
            device.storage_start(None),
            Err(DeviceError::Driver(DriverError::NotOpen))
        ));
        assert!(!device.storage_flush(0, None));
    }

    #[test]
    fn writes_raw_image_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd.img");
        let device = device(
            None,
            None,
            Some(image_storage(&path)),
            Vec::new(),
            Broadcaster::new(),
        );
        let image: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        assert!(device.storage_open(Some("alice")).unwrap());
        let port = device.storage_start(Some("alice")).unwrap();
        {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(&image).unwrap();
        }
        assert!(device.storage_flush(image.len() as u64, Some("alice")));

        wait_until(|| !device.storage_status(None).writing);
        let status = device.storage_status(None);
        assert!(!status.failed);
        assert_eq!(status.written, image.len() as u64);
        assert_eq!(device.storage_bytes_written(None), image.len() as u64);

        assert!(device.storage_close(Some("alice")).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), image);
    }
}
