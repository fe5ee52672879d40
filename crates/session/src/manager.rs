//! The session manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::event::SessionEvent;

/// Observer callback invoked for every emitted event.
type Observer = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Liveness contract consumed by long-running operations (image writes)
/// that must keep the owning session and its lock lease alive.
pub trait SessionPing: Send + Sync {
    /// Refreshes the session without altering lock semantics.
    fn ping(&self, session: &str);
}

/// State guarded by the manager's mutex.
struct State {
    /// Session id -> absolute deadline.
    sessions: HashMap<String, Instant>,
    lock_owner: Option<String>,
    lock_expiry: Instant,
    lock_timeout: Duration,
    session_timeout: Duration,
    observers: Vec<Observer>,
}

/// Arbitrates exclusive device access between sessions.
///
/// All operations are infallible: misuse such as unlocking a lock held by
/// someone else yields `false`. Every public operation performs a
/// [`check`](Self::check) of the caller's session first.
pub struct SessionManager {
    state: Mutex<State>,
}

impl SessionManager {
    /// Creates a manager with the given lock lease and session timeout.
    pub fn new(lock_timeout: Duration, session_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                sessions: HashMap::new(),
                lock_owner: None,
                lock_expiry: Instant::now(),
                lock_timeout,
                session_timeout,
                observers: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Observers never run under the lock, so a poisoned mutex can only
        // come from a panic in our own bookkeeping; the data is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an observer for all future events.
    pub fn monitor<F>(&self, observer: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.state().observers.push(Arc::new(observer));
    }

    /// Refreshes `session` (if given), purges expired sessions and releases
    /// the lock if its lease ran out.
    ///
    /// The whole update is atomic; events are delivered afterwards.
    pub fn check(&self, session: Option<&str>) {
        let mut events = Vec::new();
        let observers = {
            let mut state = self.state();
            state.check(session, Instant::now(), &mut events);
            state.observers.clone()
        };
        notify(&observers, &events);
    }

    /// Tries to acquire the device lock for `session`.
    ///
    /// Returns `false` if any session, including the caller, already holds it.
    pub fn lock(&self, session: &str) -> bool {
        self.check(Some(session));

        let mut events = Vec::new();
        let (acquired, observers) = {
            let mut state = self.state();
            let acquired = if state.lock_owner.is_none() {
                state.lock_owner = Some(session.to_string());
                state.lock_expiry = Instant::now() + state.lock_timeout;
                events.push(SessionEvent::Locked(session.to_string()));
                true
            } else {
                false
            };
            (acquired, state.observers.clone())
        };
        notify(&observers, &events);

        debug!(session, acquired, "session lock");
        acquired
    }

    /// Returns the current lock holder, if any.
    pub fn locked(&self, session: Option<&str>) -> Option<String> {
        self.check(session);
        self.state().lock_owner.clone()
    }

    /// Releases the device lock if `session` holds it.
    pub fn unlock(&self, session: &str) -> bool {
        self.check(Some(session));

        let mut events = Vec::new();
        let (released, observers) = {
            let mut state = self.state();
            let released = state.lock_owner.as_deref() == Some(session);
            if released {
                state.lock_owner = None;
                events.push(SessionEvent::Unlocked(session.to_string()));
            }
            (released, state.observers.clone())
        };
        notify(&observers, &events);

        debug!(session, released, "session unlock");
        released
    }

    /// Replaces the session timeout and returns the previous one.
    ///
    /// Sessions whose remaining time exceeds the new timeout are shortened
    /// to it, then `session` is checked.
    pub fn set_timeout(&self, timeout: Duration, session: Option<&str>) -> Duration {
        let previous = {
            let mut state = self.state();
            let previous = std::mem::replace(&mut state.session_timeout, timeout);
            let now = Instant::now();
            let cap = now + timeout;
            for deadline in state.sessions.values_mut() {
                if *deadline > cap {
                    *deadline = cap;
                }
            }
            previous
        };
        info!(?previous, ?timeout, "session timeout changed");

        self.check(session);
        previous
    }

    /// Returns the current session timeout.
    pub fn session_timeout(&self) -> Duration {
        self.state().session_timeout
    }

    /// Returns every known session with its remaining lifetime.
    pub fn sessions(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let state = self.state();
        let mut list: Vec<_> = state
            .sessions
            .iter()
            .map(|(id, deadline)| (id.clone(), deadline.saturating_duration_since(now)))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}

impl SessionPing for SessionManager {
    fn ping(&self, session: &str) {
        self.check(Some(session));
    }
}

impl State {
    fn check(&mut self, session: Option<&str>, now: Instant, events: &mut Vec<SessionEvent>) {
        if let Some(id) = session {
            let deadline = now + self.session_timeout;
            if self.sessions.insert(id.to_string(), deadline).is_none() {
                events.push(SessionEvent::Active(id.to_string()));
            }
        }

        let mut expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        for id in expired {
            self.sessions.remove(&id);
            events.push(SessionEvent::Inactive(id));
            // NONE is reported once, when the last session goes away.
            if self.sessions.is_empty() {
                events.push(SessionEvent::None);
            }
        }

        if !self.sessions.is_empty() {
            events.push(SessionEvent::Running);
        }

        // An expired lease is released before any extension: a holder
        // that comes back too late has lost the lock.
        if let Some(owner) = self.lock_owner.clone() {
            if now >= self.lock_expiry {
                info!(session = %owner, "lock lease expired");
                self.lock_owner = None;
                events.push(SessionEvent::Unlocked(owner));
            } else if session == Some(owner.as_str()) {
                self.lock_expiry = now + self.lock_timeout;
            }
        }
    }
}

fn notify(observers: &[Observer], events: &[SessionEvent]) {
    for event in events {
        debug!(%event, "session event");
        for observer in observers {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOCK: Duration = Duration::from_secs(60);
    const SESSION: Duration = Duration::from_secs(300);

    /// Manager plus a recorder of the wire form of every event.
    fn recorded() -> (Arc<SessionManager>, Arc<Mutex<Vec<String>>>) {
        let manager = Arc::new(SessionManager::new(LOCK, SESSION));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        manager.monitor(move |e| sink.lock().unwrap().push(e.to_string()));
        (manager, log)
    }

    fn drain(log: &Mutex<Vec<String>>) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn first_check_registers_session() {
        let (m, log) = recorded();
        m.check(Some("alice"));
        assert_eq!(drain(&log), vec!["ACTIVE alice", "RUNNING"]);

        // Known sessions only produce the heartbeat.
        m.check(Some("alice"));
        assert_eq!(drain(&log), vec!["RUNNING"]);
    }

    #[tokio::test(start_paused = true)]
    async fn check_without_sessions_is_silent() {
        let (m, log) = recorded();
        m.check(None);
        assert!(drain(&log).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive() {
        let (m, log) = recorded();
        assert!(m.lock("alice"));
        assert!(!m.lock("bob"));
        assert_eq!(m.locked(Some("bob")), Some("alice".to_string()));

        let events = drain(&log);
        assert!(events.contains(&"LOCKED alice".to_string()));
        assert!(!events.iter().any(|e| e == "LOCKED bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn relock_by_holder_fails() {
        let (m, _log) = recorded();
        assert!(m.lock("alice"));
        assert!(!m.lock("alice"));
        assert_eq!(m.locked(None).as_deref(), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_only_by_holder() {
        let (m, log) = recorded();
        assert!(m.lock("alice"));
        drain(&log);

        assert!(!m.unlock("bob"));
        assert!(!drain(&log).iter().any(|e| e.starts_with("UNLOCKED")));

        assert!(m.unlock("alice"));
        assert!(drain(&log).contains(&"UNLOCKED alice".to_string()));
        assert!(m.locked(None).is_none());

        // A second unlock is a no-op.
        assert!(!m.unlock("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_purged_once() {
        let (m, log) = recorded();
        m.check(Some("alice"));
        drain(&log);

        tokio::time::advance(SESSION + Duration::from_secs(1)).await;
        m.check(None);
        assert_eq!(drain(&log), vec!["INACTIVE alice", "NONE"]);

        m.check(None);
        assert!(drain(&log).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_running_while_sessions_remain() {
        let (m, log) = recorded();
        m.check(Some("alice"));
        tokio::time::advance(Duration::from_secs(200)).await;
        m.check(Some("bob"));
        drain(&log);

        tokio::time::advance(Duration::from_secs(150)).await;
        m.check(None);
        assert_eq!(drain(&log), vec!["INACTIVE alice", "RUNNING"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_releases_lock() {
        let (m, log) = recorded();
        assert!(m.lock("alice"));
        drain(&log);

        tokio::time::advance(LOCK).await;
        m.check(Some("bob"));
        assert!(drain(&log).contains(&"UNLOCKED alice".to_string()));
        assert!(m.lock("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn holder_pings_extend_lease() {
        let (m, _log) = recorded();
        assert!(m.lock("alice"));

        for _ in 0..5 {
            tokio::time::advance(LOCK / 2).await;
            m.ping("alice");
        }
        assert_eq!(m.locked(Some("bob")).as_deref(), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn other_sessions_do_not_extend_lease() {
        let (m, _log) = recorded();
        assert!(m.lock("alice"));

        tokio::time::advance(LOCK / 2).await;
        m.ping("bob");
        tokio::time::advance(LOCK / 2).await;
        assert!(m.locked(Some("bob")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_holder_ping_loses_lock() {
        let (m, log) = recorded();
        assert!(m.lock("alice"));
        drain(&log);

        tokio::time::advance(LOCK + Duration::from_secs(1)).await;
        m.ping("alice");
        assert!(drain(&log).contains(&"UNLOCKED alice".to_string()));
        assert!(m.locked(None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_caps_remaining_leases() {
        let (m, _log) = recorded();
        m.check(Some("alice"));
        m.check(Some("bob"));

        let previous = m.set_timeout(Duration::from_secs(30), None);
        assert_eq!(previous, SESSION);
        assert_eq!(m.session_timeout(), Duration::from_secs(30));
        for (id, left) in m.sessions() {
            assert!(left <= Duration::from_secs(30), "{id} has {left:?} left");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_leaves_shorter_leases_alone() {
        let (m, _log) = recorded();
        m.check(Some("alice"));
        tokio::time::advance(Duration::from_secs(290)).await;

        m.set_timeout(Duration::from_secs(60), None);
        let left = m.sessions()[0].1;
        assert_eq!(left, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_then_expiry() {
        let (m, log) = recorded();
        m.check(Some("alice"));
        m.set_timeout(Duration::from_secs(10), Some("bob"));
        drain(&log);

        tokio::time::advance(Duration::from_secs(11)).await;
        m.check(None);
        assert_eq!(drain(&log), vec!["INACTIVE alice", "INACTIVE bob", "NONE"]);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_may_reenter_manager() {
        let manager = Arc::new(SessionManager::new(LOCK, SESSION));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&manager);
        let sink = Arc::clone(&seen);
        manager.monitor(move |event| {
            if let SessionEvent::Locked(_) = event {
                // Would deadlock if events were delivered under the mutex.
                let holder = weak.upgrade().and_then(|m| m.locked(None));
                sink.lock().unwrap().push(holder);
            }
        });

        assert!(manager.lock("alice"));
        assert_eq!(*seen.lock().unwrap(), vec![Some("alice".to_string())]);
    }

    #[test]
    fn concurrent_lockers_never_overlap() {
        let manager = Arc::new(SessionManager::new(LOCK, SESSION));
        let holders = Arc::new(AtomicUsize::new(0));
        let wins = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|n| {
                let manager = Arc::clone(&manager);
                let holders = Arc::clone(&holders);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    let id = format!("client-{n}");
                    for _ in 0..200 {
                        if manager.lock(&id) {
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            wins.fetch_add(1, Ordering::SeqCst);
                            holders.fetch_sub(1, Ordering::SeqCst);
                            assert!(manager.unlock(&id));
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert!(wins.load(Ordering::SeqCst) > 0);
        assert!(manager.locked(None).is_none());
    }
}
