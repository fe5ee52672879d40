//! The device under test, as seen by remote clients.
//!
//! [`Device`] owns the drivers resolved at startup and applies the session
//! lock to every operation. Operations are synchronous: drivers talk to
//! sysfs, configfs and child processes, and stopping the image writer
//! joins its threads. The WebSocket handler runs them on the blocking
//! pool.
//!
//! Each operation refreshes the caller's session first.

mod console;
mod power;
mod storage;
mod usb;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use benchlink_agent_server::Broadcaster;
use benchlink_drivers::console::logger::DEFAULT_CAPACITY as CONSOLE_CAPACITY;
use benchlink_drivers::{
    ConsoleLogger, DriverError, GadgetContext, PowerController, PowerStatus, Registry,
    StorageController, UsbSwitch,
};
use benchlink_protocol::constants::{EVENT_SESSION, MessageType};
use benchlink_protocol::envelope::Message;
use benchlink_protocol::messages::{EventPayload, InfoResponse};
use benchlink_session::{SessionEvent, SessionManager, SessionPing};
use benchlink_storage::ImageWriter;

use crate::config::AgentConfig;
use crate::error::DeviceError;

/// Locks a driver mutex. A driver that panicked mid-call leaves its
/// hardware in whatever state it reached; the handle stays usable.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Publishes `"<KIND> <detail>"` events to every connected client.
#[derive(Clone)]
struct Events {
    broadcaster: Broadcaster,
    next_id: Arc<AtomicU64>,
}

impl Events {
    fn new(broadcaster: Broadcaster) -> Self {
        Self {
            broadcaster,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn emit(&self, kind: &str, detail: impl fmt::Display) {
        let event = format!("{kind} {detail}");
        let id = format!("event-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let payload = EventPayload {
            event: event.clone(),
        };
        match Message::new(id, MessageType::Event, Some(&payload)) {
            Ok(msg) => {
                let receivers = self.broadcaster.broadcast(&msg);
                debug!(%event, receivers, "event published");
            }
            Err(e) => warn!(%event, "failed to encode event: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct Device {
    info: InfoResponse,
    sessions: Arc<SessionManager>,
    events: Events,
    power: Option<Mutex<Box<dyn PowerController>>>,
    console: Option<Mutex<ConsoleLogger>>,
    storage: Option<Mutex<Box<dyn StorageController>>>,
    writer: Mutex<ImageWriter>,
    usb: Vec<Mutex<Box<dyn UsbSwitch>>>,
    /// When the target was last powered on through this agent.
    powered_on_at: Mutex<Option<Instant>>,
    /// Since when no session is alive.
    idle_since: Arc<Mutex<Option<Instant>>>,
    power_timeout: Option<Duration>,
    gadget: Mutex<GadgetContext>,
}

impl Device {
    /// Resolves the configured drivers and installs the USB gadget when a
    /// driver registered gadget functions.
    pub fn new(
        config: &AgentConfig,
        registry: &Registry,
        broadcaster: Broadcaster,
    ) -> Result<Self, DriverError> {
        let mut gadget = GadgetContext::new(config.gadget.clone());

        let power = config.power.as_ref().map(|s| registry.power(s)).transpose()?;
        let console = config
            .console
            .as_ref()
            .map(|s| registry.console(s))
            .transpose()?;
        let storage = config
            .storage
            .as_ref()
            .map(|s| registry.storage(s, &mut gadget))
            .transpose()?;
        let usb = config
            .usb
            .iter()
            .map(|s| registry.usb(s))
            .collect::<Result<Vec<_>, _>>()?;

        if gadget.has_functions() {
            gadget.install()?;
        }

        let info = InfoResponse {
            name: config.name.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
            power: config.power.as_ref().map(|s| s.variant.clone()),
            console: config.console.as_ref().map(|s| s.variant.clone()),
            storage: config.storage.as_ref().map(|s| s.variant.clone()),
            usb_ports: usb.len(),
        };

        let sessions = Arc::new(SessionManager::new(
            config.timeouts.lock(),
            config.timeouts.session(),
        ));
        let events = Events::new(broadcaster);
        let idle_since = Arc::new(Mutex::new(Some(Instant::now())));
        {
            let events = events.clone();
            let idle_since = Arc::clone(&idle_since);
            sessions.monitor(move |event| match event {
                // Checks run on every request; the heartbeat comes from tick().
                SessionEvent::Running => {}
                SessionEvent::None => {
                    *lock(&idle_since) = Some(Instant::now());
                    events.emit(EVENT_SESSION, event);
                }
                SessionEvent::Active(_) => {
                    *lock(&idle_since) = None;
                    events.emit(EVENT_SESSION, event);
                }
                _ => events.emit(EVENT_SESSION, event),
            });
        }

        let writer = ImageWriter::new(config.writer.to_writer_config())
            .with_session_ping(Arc::clone(&sessions) as Arc<dyn SessionPing>);

        info!(
            name = %info.name,
            power = info.power.as_deref().unwrap_or("-"),
            console = info.console.as_deref().unwrap_or("-"),
            storage = info.storage.as_deref().unwrap_or("-"),
            usb_ports = info.usb_ports,
            "device configured"
        );

        Ok(Self {
            info,
            sessions,
            events,
            power: power.map(Mutex::new),
            console: console.map(|c| Mutex::new(ConsoleLogger::new(c, CONSOLE_CAPACITY))),
            storage: storage.map(Mutex::new),
            writer: Mutex::new(writer),
            usb: usb.into_iter().map(Mutex::new).collect(),
            powered_on_at: Mutex::new(None),
            idle_since,
            power_timeout: config.timeouts.power(),
            gadget: Mutex::new(gadget),
        })
    }

    /// Starts the console reader. The console stays paused while the
    /// target is off.
    pub fn start(&self) -> Result<(), DriverError> {
        let status = self.power.as_ref().map(|p| lock(p).status());
        if status == Some(PowerStatus::On) {
            *lock(&self.powered_on_at) = Some(Instant::now());
        }

        if let Some(console) = &self.console {
            let mut logger = lock(console);
            logger.start()?;
            if status == Some(PowerStatus::Off) {
                logger.pause()?;
            }
        }
        Ok(())
    }

    /// Stops background work and releases the hardware.
    pub fn shutdown(&self) {
        lock(&self.writer).stop();
        if let Some(console) = &self.console {
            lock(console).stop();
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = lock(storage).close() {
                warn!("failed to close storage: {e}");
            }
        }
        let mut gadget = lock(&self.gadget);
        if gadget.is_installed() {
            if let Err(e) = gadget.remove() {
                warn!("failed to remove USB gadget: {e}");
            }
        }
        info!("device shut down");
    }

    /// Periodic housekeeping: expires idle sessions and locks, publishes
    /// the RUNNING heartbeat and powers the target off once no session
    /// was seen for the configured delay.
    pub fn tick(&self) {
        self.sessions.check(None);
        if !self.sessions.sessions().is_empty() {
            self.events.emit(EVENT_SESSION, SessionEvent::Running);
            return;
        }

        let Some(timeout) = self.power_timeout else {
            return;
        };
        let idle_for = {
            let mut idle = lock(&self.idle_since);
            idle.get_or_insert_with(Instant::now).elapsed()
        };
        if idle_for >= timeout {
            self.auto_power_off();
        }
    }

    /// Agent identity and configured drivers.
    pub fn info(&self, session: Option<&str>) -> InfoResponse {
        self.sessions.check(session);
        self.info.clone()
    }

    // -- sessions --------------------------------------------------------

    pub fn session_check(&self, session: Option<&str>) {
        self.sessions.check(session);
    }

    pub fn session_lock(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        let session = require_session(session)?;
        Ok(self.sessions.lock(session))
    }

    pub fn session_locked(&self, session: Option<&str>) -> Option<String> {
        self.sessions.locked(session)
    }

    pub fn session_unlock(&self, session: Option<&str>) -> Result<bool, DeviceError> {
        let session = require_session(session)?;
        Ok(self.sessions.unlock(session))
    }

    /// Replaces the session timeout and returns the previous one.
    pub fn session_set_timeout(&self, timeout: Duration, session: Option<&str>) -> Duration {
        self.sessions.set_timeout(timeout, session)
    }

    /// Whether a session other than `session` holds the device lock.
    fn locked_by_other(&self, session: Option<&str>) -> bool {
        match self.sessions.locked(session) {
            Some(holder) => Some(holder.as_str()) != session,
            None => false,
        }
    }

    fn require_unlocked(&self, session: Option<&str>) -> Result<(), DeviceError> {
        if self.locked_by_other(session) {
            return Err(DeviceError::Locked);
        }
        Ok(())
    }
}

fn require_session(session: Option<&str>) -> Result<&str, DeviceError> {
    session.ok_or_else(|| DeviceError::BadRequest("a session id is required".into()))
}
