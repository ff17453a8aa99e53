//! Reader status record.
//!
//! Every reader instance carries one [`StatusRecord`]. It starts out as
//! [`Status::Initialized`] and moves through `Busy` (configuring), `Running`,
//! `Warning` and `Error`. Subscribers only see changes: setting the same
//! status twice is a no-op.

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// The state of a reader connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Created, never connected.
    Initialized,
    /// Transient work in progress, e.g. `"configuring"`.
    Busy(String),
    /// Configured and healthy.
    Running,
    /// Degraded but still delivering data, e.g. one antenna failing.
    Warning(String),
    /// Not usable until the next successful configuration.
    Error(String),
}

impl Status {
    /// Numeric status code: running 1, busy/initialized 0, error -1, warning -2.
    pub fn code(&self) -> i8 {
        match self {
            Status::Running => 1,
            Status::Initialized | Status::Busy(_) => 0,
            Status::Error(_) => -1,
            Status::Warning(_) => -2,
        }
    }

    /// The status message.
    pub fn message(&self) -> &str {
        match self {
            Status::Initialized => "initialised",
            Status::Running => "running",
            Status::Busy(m) | Status::Warning(m) | Status::Error(m) => m,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running)
    }

    /// Running or degraded; the reader answers commands and pushes events.
    pub fn is_operational(&self) -> bool {
        matches!(self, Status::Running | Status::Warning(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// A status value with its owning instance and the time it was entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    /// Reader instance name.
    pub instance: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

/// Holds the current status of one reader and publishes changes.
///
/// Backed by a [`watch`] channel so that waiters (for example `connect`)
/// can await transitions without polling.
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<StatusRecord>,
}

impl StatusCell {
    pub fn new(instance: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(StatusRecord {
            instance: instance.into(),
            status: Status::Initialized,
            timestamp: Utc::now(),
        });
        Self { tx }
    }

    /// Current status value.
    pub fn get(&self) -> Status {
        self.tx.borrow().status.clone()
    }

    /// Current status record.
    pub fn record(&self) -> StatusRecord {
        self.tx.borrow().clone()
    }

    /// Update the status. Returns the new record if it differs from the old one.
    pub fn set(&self, status: Status) -> Option<StatusRecord> {
        let mut changed = None;
        self.tx.send_if_modified(|record| {
            if record.status == status {
                return false;
            }
            record.status = status;
            record.timestamp = Utc::now();
            changed = Some(record.clone());
            true
        });
        changed
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<StatusRecord> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Status::Running.code(), 1);
        assert_eq!(Status::Busy("configuring".into()).code(), 0);
        assert_eq!(Status::Initialized.code(), 0);
        assert_eq!(Status::Error("x".into()).code(), -1);
        assert_eq!(Status::Warning("x".into()).code(), -2);
    }

    #[test]
    fn status_messages() {
        assert_eq!(Status::Initialized.message(), "initialised");
        assert_eq!(Status::Running.message(), "running");
        assert_eq!(Status::Error("connection lost".into()).message(), "connection lost");
        assert_eq!(Status::Running.to_string(), "running (1)");
    }

    #[test]
    fn cell_starts_initialized() {
        let cell = StatusCell::new("reader1");
        assert_eq!(cell.get(), Status::Initialized);
        assert_eq!(cell.record().instance, "reader1");
    }

    #[test]
    fn set_reports_only_changes() {
        let cell = StatusCell::new("reader1");
        assert!(cell.set(Status::Busy("configuring".into())).is_some());
        assert!(cell.set(Status::Busy("configuring".into())).is_none());
        assert!(cell.set(Status::Running).is_some());
        assert!(cell.set(Status::Running).is_none());
        let record = cell.set(Status::Error("connection lost".into())).unwrap();
        assert_eq!(record.status, Status::Error("connection lost".into()));
        assert_eq!(record.instance, "reader1");
    }

    #[test]
    fn different_message_is_a_change() {
        let cell = StatusCell::new("r");
        cell.set(Status::Error("a".into()));
        assert!(cell.set(Status::Error("b".into())).is_some());
    }

    #[tokio::test]
    async fn subscriber_sees_change() {
        let cell = StatusCell::new("r");
        let mut rx = cell.subscribe();
        cell.set(Status::Running);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, Status::Running);
    }

    #[test]
    fn operational_states() {
        assert!(Status::Running.is_operational());
        assert!(Status::Warning("w".into()).is_operational());
        assert!(!Status::Busy("b".into()).is_operational());
        assert!(!Status::Error("e".into()).is_operational());
    }
}
