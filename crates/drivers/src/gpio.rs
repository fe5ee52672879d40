//! Sysfs GPIO lines (`/sys/class/gpio`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Default sysfs GPIO class directory.
pub const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// An exported output line.
#[derive(Debug, Clone)]
pub struct GpioLine {
    pin: u32,
    dir: PathBuf,
}

impl GpioLine {
    /// Exports `pin` under `root` (unless already exported) and configures
    /// it as an output.
    pub fn output(root: &Path, pin: u32) -> io::Result<Self> {
        let dir = root.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(root.join("export"), pin.to_string())?;
            debug!(pin, "gpio exported");
        }

        let direction = dir.join("direction");
        let current = fs::read_to_string(&direction).unwrap_or_default();
        if current.trim() != "out" {
            fs::write(&direction, "out")?;
        }
        Ok(Self { pin, dir })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Drives the line high or low.
    pub fn set(&self, high: bool) -> io::Result<()> {
        fs::write(self.dir.join("value"), if high { "1" } else { "0" })
    }

    /// Reads the line level.
    pub fn get(&self) -> io::Result<bool> {
        let value = fs::read_to_string(self.dir.join("value"))?;
        match value.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("gpio{}: unexpected value {other:?}", self.pin),
            )),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn output_sets_direction_and_value() {
        let root = tempfile::tempdir().unwrap();
        fake_line(root.path(), 17, "0");

        let line = GpioLine::output(root.path(), 17).unwrap();
        let direction = fs::read_to_string(root.path().join("gpio17/direction")).unwrap();
        assert_eq!(direction, "out");

        line.set(true).unwrap();
        assert_eq!(read_value(root.path(), 17), "1");
        assert!(line.get().unwrap());
    }

    #[test]
    fn output_exports_missing_line() {
        let root = tempfile::tempdir().unwrap();
        // No kernel here to create gpio5/ in response; the export write is
        // what gets checked.
        let err = GpioLine::output(root.path(), 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "5");
    }

    #[test]
    fn garbage_value_is_invalid_data() {
        let root = tempfile::tempdir().unwrap();
        fake_line(root.path(), 3, "x\n");
        let line = GpioLine::output(root.path(), 3).unwrap();
        assert_eq!(line.get().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
