use std::fmt;

/// An event emitted by the [`SessionManager`](crate::SessionManager).
///
/// The wire form is `"<EVENT> [arg]"`, see the [`fmt::Display`] impl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was seen for the first time.
    Active(String),
    /// A session timed out and was purged.
    Inactive(String),
    /// At least one session is alive. Repeated on every check.
    Running,
    /// The last session was purged.
    None,
    /// A session acquired the device lock.
    Locked(String),
    /// The device lock was released, explicitly or by lease expiry.
    Unlocked(String),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Active(s) => write!(f, "ACTIVE {s}"),
            SessionEvent::Inactive(s) => write!(f, "INACTIVE {s}"),
            SessionEvent::Running => f.write_str("RUNNING"),
            SessionEvent::None => f.write_str("NONE"),
            SessionEvent::Locked(s) => write!(f, "LOCKED {s}"),
            SessionEvent::Unlocked(s) => write!(f, "UNLOCKED {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings() {
        assert_eq!(SessionEvent::Active("a".into()).to_string(), "ACTIVE a");
        assert_eq!(SessionEvent::Inactive("a".into()).to_string(), "INACTIVE a");
        assert_eq!(SessionEvent::Running.to_string(), "RUNNING");
        assert_eq!(SessionEvent::None.to_string(), "NONE");
        assert_eq!(SessionEvent::Locked("b".into()).to_string(), "LOCKED b");
        assert_eq!(SessionEvent::Unlocked("b".into()).to_string(), "UNLOCKED b");
    }
}
