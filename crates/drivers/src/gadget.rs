//! USB gadget composed through configfs.
//!
//! Drivers that expose a USB function to the target (mass storage, ...)
//! register it here while they are configured. The caller then installs
//! the gadget once, and removes it on shutdown:
//!
//! ```text
//! let mut gadget = GadgetContext::new(config);
//! let storage = registry.storage(&spec, &mut gadget)?;
//! gadget.install()?;
//! ...
//! gadget.remove()?;
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::DriverError;

const VENDOR_ID: &str = "0x1d6b"; // Linux Foundation
const PRODUCT_ID: &str = "0x0104"; // Multifunction Composite Gadget
const LANG: &str = "0x409";
const CONFIG: &str = "c.1";

const MASS_STORAGE: &str = "mass_storage.usb0";

/// Gadget settings (`[gadget]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GadgetConfig {
    /// configfs `usb_gadget` directory.
    #[serde(default = "default_configfs")]
    pub configfs: PathBuf,
    /// Name of the gadget directory.
    #[serde(default = "default_name")]
    pub name: String,
    /// USB device controller to bind; the first one found when unset.
    #[serde(default)]
    pub udc: Option<String>,
    /// Directory listing the available device controllers.
    #[serde(default = "default_udc_class")]
    pub udc_class: PathBuf,
    #[serde(default = "default_serial")]
    pub serial: String,
}

fn default_configfs() -> PathBuf {
    PathBuf::from("/sys/kernel/config/usb_gadget")
}

fn default_name() -> String {
    "benchlink".into()
}

fn default_udc_class() -> PathBuf {
    PathBuf::from("/sys/class/udc")
}

fn default_serial() -> String {
    "benchlink-0001".into()
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            configfs: default_configfs(),
            name: default_name(),
            udc: None,
            udc_class: default_udc_class(),
            serial: default_serial(),
        }
    }
}

/// The composite gadget and the functions registered into it.
pub struct GadgetContext {
    config: GadgetConfig,
    functions: Vec<&'static str>,
    installed: bool,
}

impl GadgetContext {
    pub fn new(config: GadgetConfig) -> Self {
        Self {
            config,
            functions: Vec::new(),
            installed: false,
        }
    }

    /// Gadget directory under configfs.
    pub fn path(&self) -> PathBuf {
        self.config.configfs.join(&self.config.name)
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Whether any function was registered.
    pub fn has_functions(&self) -> bool {
        !self.functions.is_empty()
    }

    /// Registers the mass-storage function and returns the path of its
    /// LUN's backing-file attribute.
    pub fn add_mass_storage(&mut self) -> Result<PathBuf, DriverError> {
        if self.installed {
            return Err(DriverError::Gadget(
                "functions cannot be added once the gadget is installed".into(),
            ));
        }
        if !self.functions.contains(&MASS_STORAGE) {
            self.functions.push(MASS_STORAGE);
        }
        Ok(self.lun_dir().join("file"))
    }

    fn lun_dir(&self) -> PathBuf {
        self.path().join("functions").join(MASS_STORAGE).join("lun.0")
    }

    /// Creates the gadget with its functions and binds it to the UDC.
    pub fn install(&mut self) -> Result<(), DriverError> {
        if self.installed {
            return Ok(());
        }
        if self.functions.is_empty() {
            debug!("no USB functions registered, gadget not installed");
            return Ok(());
        }

        // A previous run may have left the gadget behind.
        self.remove()?;

        let path = self.path();
        let strings = path.join("strings").join(LANG);
        let config = path.join("configs").join(CONFIG);
        let config_strings = config.join("strings").join(LANG);
        fs::create_dir_all(&strings)?;
        fs::create_dir_all(&config_strings)?;

        write(&path.join("idVendor"), VENDOR_ID)?;
        write(&path.join("idProduct"), PRODUCT_ID)?;
        write(&path.join("bcdDevice"), "0x0100")?;
        write(&path.join("bcdUSB"), "0x0200")?;
        write(&strings.join("serialnumber"), &self.config.serial)?;
        write(&strings.join("manufacturer"), "benchlink")?;
        write(&strings.join("product"), "benchlink device access")?;
        write(&config_strings.join("configuration"), "Config 1")?;
        write(&config.join("MaxPower"), "250")?;

        for function in &self.functions {
            let dir = path.join("functions").join(function);
            fs::create_dir_all(&dir)?;
            if *function == MASS_STORAGE {
                let lun = self.lun_dir();
                fs::create_dir_all(&lun)?;
                write(&lun.join("cdrom"), "0")?;
                write(&lun.join("ro"), "0")?;
                write(&lun.join("nofua"), "0")?;
                write(&lun.join("file"), "")?;
            }
            let link = config.join(function);
            if !link.exists() {
                std::os::unix::fs::symlink(&dir, &link)?;
            }
        }

        let udc = self.udc()?;
        write(&path.join("UDC"), &udc)?;
        self.installed = true;
        info!(gadget = %path.display(), udc = %udc, functions = ?self.functions, "USB gadget installed");
        Ok(())
    }

    fn udc(&self) -> Result<String, DriverError> {
        if let Some(udc) = &self.config.udc {
            return Ok(udc.clone());
        }
        let mut names: Vec<String> = fs::read_dir(&self.config.udc_class)?
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Gadget("no USB device controller found".into()))
    }

    /// Unbinds and deletes the gadget. No-op when it does not exist.
    pub fn remove(&mut self) -> Result<(), DriverError> {
        let path = self.path();
        if !path.exists() {
            self.installed = false;
            return Ok(());
        }

        let udc = path.join("UDC");
        if udc.exists() {
            write(&udc, "")?;
        }

        let config = path.join("configs").join(CONFIG);
        let functions: Vec<_> = match fs::read_dir(path.join("functions")) {
            Ok(entries) => entries.flatten().map(|e| e.file_name()).collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for function in &functions {
            remove_if_exists(&config.join(function), |p| fs::remove_file(p))?;
        }
        remove_if_exists(&config.join("strings").join(LANG), |p| fs::remove_dir(p))?;
        remove_if_exists(&config, |p| fs::remove_dir(p))?;
        for function in &functions {
            remove_if_exists(&path.join("functions").join(function), |p| fs::remove_dir(p))?;
        }
        remove_if_exists(&path.join("strings").join(LANG), |p| fs::remove_dir(p))?;
        fs::remove_dir(&path)?;

        self.installed = false;
        info!(gadget = %path.display(), "USB gadget removed");
        Ok(())
    }
}

impl Drop for GadgetContext {
    fn drop(&mut self) {
        if self.installed {
            if let Err(e) = self.remove() {
                warn!("failed to remove USB gadget: {e}");
            }
        }
    }
}

fn write(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, value)
}

fn remove_if_exists(path: &Path, op: fn(&Path) -> io::Result<()>) -> io::Result<()> {
    match op(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
