//! Target power control.

pub mod gpio;
pub mod shellcmd;

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::DriverError;

pub use gpio::GpioPower;
pub use shellcmd::ShellCmdPower;

/// Power state of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStatus {
    On,
    Off,
    /// The controller cannot tell (disagreeing lines, failed probe).
    Unsure,
}

impl PowerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerStatus::On => "ON",
            PowerStatus::Off => "OFF",
            PowerStatus::Unsure => "???",
        }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interval at which [`PowerController::wait`] re-reads the status.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Switches the target's power.
pub trait PowerController: Send {
    /// Powers the target on. Returns whether it reports on afterwards.
    fn on(&mut self) -> Result<bool, DriverError>;

    /// Powers the target off. Returns whether it reports off afterwards.
    fn off(&mut self) -> Result<bool, DriverError>;

    /// Reads the current power state from the device.
    fn status(&mut self) -> PowerStatus;

    /// Flips the power state and returns the new one.
    fn toggle(&mut self) -> Result<PowerStatus, DriverError> {
        if self.status() == PowerStatus::Off {
            self.on()?;
        } else {
            self.off()?;
        }
        Ok(self.status())
    }

    /// Blocks until the target reports on, or `timeout` elapses.
    fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.status() == PowerStatus::On {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
    }
}
