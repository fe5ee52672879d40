//! Target console buffer.
//!
//! Reading the oldest line and counting lines are open to every session;
//! everything that consumes the buffer or writes to the target is refused
//! while another session holds the lock.

use std::sync::{Mutex, MutexGuard};

use benchlink_drivers::ConsoleLogger;

use super::{Device, lock};
use crate::error::DeviceError;

impl Device {
    /// Pops the oldest buffered line.
    pub fn console_head(&self, session: Option<&str>) -> Result<Option<String>, DeviceError> {
        self.sessions.check(session);
        Ok(self.console_logger()?.head())
    }

    pub fn console_lines(&self, session: Option<&str>) -> Result<usize, DeviceError> {
        self.sessions.check(session);
        Ok(self.console_logger()?.lines())
    }

    /// Returns the most recent output and discards the buffer.
    pub fn console_tail(&self, session: Option<&str>) -> Result<Option<String>, DeviceError> {
        Ok(self.locked_console(session)?.tail())
    }

    /// Returns and consumes everything buffered.
    pub fn console_dump(&self, session: Option<&str>) -> Result<Option<String>, DeviceError> {
        Ok(Some(self.locked_console(session)?.dump()))
    }

    /// Empties the buffer and returns what was discarded.
    pub fn console_clear(&self, session: Option<&str>) -> Result<Option<String>, DeviceError> {
        let logger = self.locked_console(session)?;
        let data = logger.dump();
        logger.clear();
        Ok(Some(data))
    }

    /// Writes `data` to the target's console.
    pub fn console_send(&self, data: &str, session: Option<&str>) -> Result<(), DeviceError> {
        let sent = self.locked_console(session)?.send(data.as_bytes())?;
        tracing::debug!(bytes = sent, "console input sent");
        Ok(())
    }

    fn console_logger(&self) -> Result<MutexGuard<'_, ConsoleLogger>, DeviceError> {
        self.console
            .as_ref()
            .map(|c: &Mutex<ConsoleLogger>| lock(c))
            .ok_or(DeviceError::NoDriver("console"))
    }

    fn locked_console(
        &self,
        session: Option<&str>,
    ) -> Result<MutexGuard<'_, ConsoleLogger>, DeviceError> {
        self.sessions.check(session);
        let logger = self.console_logger()?;
        self.require_unlocked(session)?;
        Ok(logger)
    }
}

#[cfg(test)]
mod tests {
    use benchlink_agent_server::Broadcaster;

    use super::super::testing::*;
    use super::*;

    fn with_console() -> (Device, FakeConsole) {
        let console = FakeConsole::default();
        let device = device(None, Some(console.clone()), None, Vec::new(), Broadcaster::new());
        (device, console)
    }

    #[test]
    fn send_reaches_the_console() {
        let (device, console) = with_console();
        device.console_send("root\n", Some("alice")).unwrap();
        assert_eq!(*console.sent.lock().unwrap(), b"root\n");
    }

    #[test]
    fn lock_guards_consuming_operations() {
        let (device, console) = with_console();
        assert!(device.session_lock(Some("alice")).unwrap());

        assert_eq!(device.console_lines(Some("bob")).unwrap(), 0);
        assert_eq!(device.console_head(Some("bob")).unwrap(), None);
        for result in [
            device.console_tail(Some("bob")),
            device.console_dump(Some("bob")),
            device.console_clear(Some("bob")),
        ] {
            assert!(matches!(result, Err(DeviceError::Locked)));
        }
        assert!(matches!(
            device.console_send("x", Some("bob")),
            Err(DeviceError::Locked)
        ));
        assert!(console.sent.lock().unwrap().is_empty());

        assert_eq!(device.console_dump(Some("alice")).unwrap(), Some(String::new()));
    }

    #[test]
    fn without_console() {
        let device = device(None, None, None, Vec::new(), Broadcaster::new());
        let err = device.console_head(None).unwrap_err();
        assert_eq!(err.code(), 503);
    }
}
