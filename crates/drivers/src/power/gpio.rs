//! Power through one or more sysfs GPIO lines.
//!
//! All lines are driven together. The target is on when every line reads
//! high; lines that disagree make the state unsure.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{PowerController, PowerStatus};
use crate::DriverError;
use crate::gpio::{DEFAULT_GPIO_ROOT, GpioLine};
use crate::registry::DriverSpec;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    pins: Vec<u32>,
    #[serde(default = "default_root")]
    root: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_GPIO_ROOT)
}

pub struct GpioPower {
    lines: Vec<GpioLine>,
    /// Last state commanded through this controller.
    power_state: PowerStatus,
}

impl GpioPower {
    pub fn from_spec(spec: &DriverSpec) -> Result<Self, DriverError> {
        let opts: Options = spec.options("power")?;
        if opts.pins.is_empty() {
            return Err(DriverError::config("power", "gpio: no pins configured"));
        }
        let lines = opts
            .pins
            .iter()
            .map(|&pin| GpioLine::output(&opts.root, pin))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            lines,
            power_state: PowerStatus::Unsure,
        })
    }

    fn drive(&mut self, high: bool) -> Result<PowerStatus, DriverError> {
        for line in &self.lines {
            line.set(high)?;
        }
        self.power_state = if high {
            PowerStatus::On
        } else {
            PowerStatus::Off
        };
        Ok(self.status())
    }
}

impl PowerController for GpioPower {
    fn on(&mut self) -> Result<bool, DriverError> {
        Ok(self.drive(true)? == PowerStatus::On)
    }

    fn off(&mut self) -> Result<bool, DriverError> {
        Ok(self.drive(false)? == PowerStatus::Off)
    }

    fn status(&mut self) -> PowerStatus {
        let mut result = None;
        for line in &self.lines {
            let value = match line.get() {
                Ok(true) => PowerStatus::On,
                Ok(false) => PowerStatus::Off,
                Err(e) => {
                    warn!(pin = line.pin(), "gpio read failed: {e}");
                    return PowerStatus::Unsure;
                }
            };
            match result {
                None => result = Some(value),
                Some(prev) if prev != value => return PowerStatus::Unsure,
                Some(_) => {}
            }
        }
        let status = result.unwrap_or(PowerStatus::Unsure);
        if status != self.power_state {
            debug!(commanded = %self.power_state, %status, "power lines differ from last command");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::testing::{fake_line, read_value};

    fn spec(root: &std::path::Path, pins: &str) -> DriverSpec {
        DriverSpec::parse(&format!(
            "variant = \"gpio\"\npins = {pins}\nroot = {:?}",
            root.display().to_string()
        ))
        .unwrap()
    }

    #[test]
    fn drives_all_lines() {
        let root = tempfile::tempdir().unwrap();
        fake_line(root.path(), 17, "0");
        fake_line(root.path(), 27, "0");

        let mut power = GpioPower::from_spec(&spec(root.path(), "[17, 27]")).unwrap();
        assert_eq!(power.status(), PowerStatus::Off);

        assert!(power.on().unwrap());
        assert_eq!(read_value(root.path(), 17), "1");
        assert_eq!(read_value(root.path(), 27), "1");
        assert_eq!(power.status(), PowerStatus::On);

        assert_eq!(power.toggle().unwrap(), PowerStatus::Off);
        assert_eq!(read_value(root.path(), 27), "0");
    }

    #[test]
    fn disagreeing_lines_are_unsure() {
        let root = tempfile::tempdir().unwrap();
        fake_line(root.path(), 1, "1");
        fake_line(root.path(), 2, "0");

        let mut power = GpioPower::from_spec(&spec(root.path(), "[1, 2]")).unwrap();
        assert_eq!(power.status(), PowerStatus::Unsure);
    }

    #[test]
    fn empty_pin_list_rejected() {
        let root = tempfile::tempdir().unwrap();
        let err = GpioPower::from_spec(&spec(root.path(), "[]")).err().unwrap();
        assert!(matches!(err, DriverError::Config { .. }));
    }
}
