//! Session tracking and exclusive device lock arbitration.
//!
//! Remote clients identify themselves with an opaque session id. Every
//! request refreshes the caller's session; sessions that stay silent for
//! longer than the session timeout are purged. One session at a time may
//! hold the device lock, and the lock is leased: the holder keeps it only
//! while it keeps pinging within the lock timeout.
//!
//! State changes are reported to observers as [`SessionEvent`] values,
//! always after the internal mutex has been released.

mod event;
mod manager;

pub use event::SessionEvent;
pub use manager::{SessionManager, SessionPing};

use std::time::Duration;

/// Default lock lease (5 minutes).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default session timeout (5 minutes).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
