//! Switchable USB ports, numbered from 1.

use std::sync::Mutex;

use tracing::info;

use benchlink_drivers::UsbSwitch;

use super::{Device, lock};
use crate::error::DeviceError;

impl Device {
    pub fn usb_ports(&self, session: Option<&str>) -> usize {
        self.sessions.check(session);
        self.usb.len()
    }

    pub fn usb_on(&self, port: usize, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        let switched = lock(self.usb_port(port)?).on()?;
        info!(port, switched, "USB port on");
        Ok(switched)
    }

    pub fn usb_off(&self, port: usize, session: Option<&str>) -> Result<bool, DeviceError> {
        self.sessions.check(session);
        let switched = lock(self.usb_port(port)?).off()?;
        info!(port, switched, "USB port off");
        Ok(switched)
    }

    /// Flips the port and returns its new state.
    pub fn usb_toggle(&self, port: usize, session: Option<&str>) -> Result<String, DeviceError> {
        self.sessions.check(session);
        let status = lock(self.usb_port(port)?).toggle()?;
        info!(port, %status, "USB port toggled");
        Ok(status.as_str().into())
    }

    /// `"ON"`, `"OFF"` or `"???"`.
    pub fn usb_status(&self, port: usize, session: Option<&str>) -> Result<String, DeviceError> {
        self.sessions.check(session);
        let status = lock(self.usb_port(port)?).status();
        Ok(status.as_str().into())
    }

    /// First port whose device matches `class`.
    pub fn usb_find_by_class(&self, class: &str, session: Option<&str>) -> Option<usize> {
        self.sessions.check(session);
        self.usb
            .iter()
            .position(|port| lock(port).class_name() == class)
            .map(|index| index + 1)
    }

    fn usb_port(&self, port: usize) -> Result<&Mutex<Box<dyn UsbSwitch>>, DeviceError> {
        port.checked_sub(1)
            .and_then(|index| self.usb.get(index))
            .ok_or(DeviceError::InvalidPort(port))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use benchlink_agent_server::Broadcaster;

    use super::super::testing::*;
    use super::*;

    fn ports() -> (Device, Vec<FakeUsb>) {
        let usb = vec![
            FakeUsb {
                class: "keyboard",
                on: Arc::new(Mutex::new(false)),
            },
            FakeUsb {
                class: "storage",
                on: Arc::new(Mutex::new(false)),
            },
        ];
        let device = device(None, None, None, usb.clone(), Broadcaster::new());
        (device, usb)
    }

    #[test]
    fn ports_are_one_based() {
        let (device, usb) = ports();
        assert_eq!(device.usb_ports(None), 2);

        assert!(device.usb_on(2, None).unwrap());
        assert!(*usb[1].on.lock().unwrap());
        assert!(!*usb[0].on.lock().unwrap());
        assert_eq!(device.usb_status(2, None).unwrap(), "ON");
        assert_eq!(device.usb_status(1, None).unwrap(), "OFF");

        assert_eq!(device.usb_toggle(2, None).unwrap(), "OFF");
        assert!(device.usb_off(1, None).unwrap());
    }

    #[test]
    fn invalid_port() {
        let (device, _) = ports();
        for port in [0, 3] {
            let err = device.usb_on(port, None).unwrap_err();
            assert!(matches!(err, DeviceError::InvalidPort(p) if p == port));
            assert_eq!(err.code(), 404);
        }
        assert!(device.usb_status(7, None).is_err());
    }

    #[test]
    fn find_by_class() {
        let (device, _) = ports();
        assert_eq!(device.usb_find_by_class("storage", None), Some(2));
        assert_eq!(device.usb_find_by_class("keyboard", None), Some(1));
        assert_eq!(device.usb_find_by_class("mouse", None), None);
    }
}
