//! Target power.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use benchlink_drivers::{PowerController, PowerStatus};
use benchlink_protocol::constants::EVENT_POWER;

use super::{Device, lock};
use crate::error::DeviceError;

/// Reply of a power switch requested while another session holds the lock.
pub const POWER_LOCKED: &str = "LOCKED";

impl Device {
    /// Powers the target on. No-op when it already is.
    ///
    /// Returns `false` when another session holds the lock or the driver
    /// did not switch.
    pub fn target_on(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        self.switch_power(PowerStatus::On, session)
    }

    /// Powers the target off. No-op when it already is.
    pub fn target_off(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        self.switch_power(PowerStatus::Off, session)
    }

    /// Flips the power state and returns the new one, or
    /// [`POWER_LOCKED`] when another session holds the lock.
    pub fn target_toggle(&self, session: Option<&str>) -> Result<String, DeviceError> {
        self.sessions.check(session);
        let power = self.power_driver()?;
        if self.locked_by_other(session) {
            return Ok(POWER_LOCKED.into());
        }

        let status = lock(power).status();
        match status {
            PowerStatus::On => self.set_power(power, PowerStatus::Off)?,
            PowerStatus::Off => self.set_power(power, PowerStatus::On)?,
            PowerStatus::Unsure => false,
        };
        Ok(lock(power).status().as_str().into())
    }

    /// `"ON"`, `"OFF"` or `"???"`, also when no power driver is configured.
    pub fn target_status(&self, session: Option<&str>) -> String {
        self.sessions.check(session);
        self.power_status().as_str().into()
    }

    /// Time since the target was powered on, zero while it is off.
    pub fn target_uptime(&self, session: Option<&str>) -> Duration {
        self.sessions.check(session);
        lock(&self.powered_on_at)
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Whether `session` may not switch power.
    pub fn power_locked(&self, session: Option<&str>) -> bool {
        self.sessions.check(session);
        self.power.is_none() || self.locked_by_other(session)
    }

    pub(super) fn power_status(&self) -> PowerStatus {
        self.power
            .as_ref()
            .map_or(PowerStatus::Unsure, |p| lock(p).status())
    }

    fn power_driver(&self) -> Result<&Mutex<Box<dyn PowerController>>, DeviceError> {
        self.power.as_ref().ok_or(DeviceError::NoDriver("power"))
    }

    fn switch_power(&self, wanted: PowerStatus, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        let power = self.power_driver()?;
        if lock(power).status() == wanted {
            return Ok(true);
        }
        if self.locked_by_other(session) {
            return Ok(false);
        }
        self.set_power(power, wanted)
    }

    /// Drives the controller to `wanted` and publishes the change.
    fn set_power(
        &self,
        power: &Mutex<Box<dyn PowerController>>,
        wanted: PowerStatus,
    ) -> Result<bool, DeviceError> {
        let switched = {
            let mut power = lock(power);
            match wanted {
                PowerStatus::On => power.on()?,
                _ => power.off()?,
            }
        };
        if switched {
            self.power_changed(wanted);
        }
        Ok(switched)
    }

    fn power_changed(&self, status: PowerStatus) {
        *lock(&self.powered_on_at) = (status == PowerStatus::On).then(Instant::now);

        if let Some(console) = &self.console {
            let logger = lock(console);
            let result = if status == PowerStatus::On {
                logger.resume()
            } else {
                logger.pause()
            };
            if let Err(e) = result {
                warn!(%status, "console did not follow power change: {e}");
            }
        }

        info!(%status, "target power changed");
        self.events.emit(EVENT_POWER, status);
    }

    /// Powers the target off after the idle delay, regardless of locks.
    pub(super) fn auto_power_off(&self) {
        let Some(power) = &self.power else {
            return;
        };
        if lock(power).status() != PowerStatus::On {
            return;
        }
        info!("no session left, powering the target off");
        if let Err(e) = self.set_power(power, PowerStatus::Off) {
            warn!("automatic power off failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use benchlink_agent_server::Broadcaster;

    use super::super::testing::*;
    use super::*;

    fn powered(initial: Option<bool>) -> (Device, FakePower, FakeConsole) {
        let power = FakePower::default();
        *power.state.lock().unwrap() = initial;
        let console = FakeConsole::default();
        let device = device(
            Some(power.clone()),
            Some(console.clone()),
            None,
            Vec::new(),
            Broadcaster::new(),
        );
        (device, power, console)
    }

    #[test]
    fn on_and_off_are_idempotent() {
        let (device, power, _) = powered(Some(false));

        assert!(device.target_off(Some("alice")).unwrap());
        assert!(power.calls.lock().unwrap().is_empty());

        assert!(device.target_on(Some("alice")).unwrap());
        assert!(device.target_on(Some("alice")).unwrap());
        assert_eq!(*power.calls.lock().unwrap(), vec!["on"]);
        assert_eq!(device.target_status(None), "ON");
    }

    #[test]
    fn lock_holder_owns_power() {
        let (device, power, _) = powered(Some(false));
        assert!(device.session_lock(Some("alice")).unwrap());

        assert!(device.power_locked(Some("bob")));
        assert!(!device.power_locked(Some("alice")));
        assert!(!device.target_on(Some("bob")).unwrap());
        assert_eq!(device.target_toggle(Some("bob")).unwrap(), POWER_LOCKED);
        assert!(power.calls.lock().unwrap().is_empty());

        assert_eq!(device.target_toggle(Some("alice")).unwrap(), "ON");
        assert_eq!(device.target_toggle(Some("alice")).unwrap(), "OFF");
        assert_eq!(*power.calls.lock().unwrap(), vec!["on", "off"]);
    }

    #[test]
    fn uptime_follows_power() {
        let (device, _, _) = powered(Some(false));
        assert_eq!(device.target_uptime(None), Duration::ZERO);

        device.target_on(None).unwrap();
        assert!(lock(&device.powered_on_at).is_some());

        device.target_off(None).unwrap();
        assert_eq!(device.target_uptime(None), Duration::ZERO);
    }

    #[test]
    fn console_pauses_while_off() {
        let (device, _, _) = powered(Some(false));
        device.start().unwrap();
        let paused = |d: &Device| lock(d.console.as_ref().unwrap()).is_paused();
        assert!(paused(&device));

        device.target_on(None).unwrap();
        assert!(!paused(&device));
        device.target_off(None).unwrap();
        assert!(paused(&device));
        device.shutdown();
    }

    #[test]
    fn unsure_state_is_left_alone_by_toggle() {
        let (device, power, _) = powered(None);
        assert_eq!(device.target_toggle(None).unwrap(), "???");
        assert!(power.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn without_driver() {
        let device = device(None, None, None, Vec::new(), Broadcaster::new());
        assert!(device.power_locked(Some("alice")));
        assert_eq!(device.target_status(None), "???");
        assert!(matches!(
            device.target_on(None),
            Err(DeviceError::NoDriver("power"))
        ));
    }

    #[test]
    fn idle_target_is_powered_off() {
        let (mut device, power, _) = powered(Some(true));
        device.power_timeout = Some(Duration::ZERO);

        device.session_check(Some("alice"));
        device.tick();
        assert_eq!(device.target_status(None), "ON");

        // A tick without sessions once the delay elapsed switches it off.
        device.sessions.set_timeout(Duration::ZERO, None);
        device.tick();
        assert_eq!(device.target_status(None), "OFF");
        assert_eq!(*power.calls.lock().unwrap(), vec!["off"]);
    }
}
