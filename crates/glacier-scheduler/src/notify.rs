//! Fire-and-forget event notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::types::format_bytes;

/// Something worth telling the operator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    JobSucceeded {
        job: String,
        files: u64,
        bytes: u64,
    },
    JobFailed {
        job: String,
        error: String,
        attempt: u32,
        /// When the next retry happens, if any.
        retry_at: Option<DateTime<Utc>>,
    },
    DestinationFull {
        job: String,
        destination: String,
    },
    RetriesExhausted {
        job: String,
        failures: u32,
    },
    ConfigError {
        detail: String,
    },
    InvalidSchedule {
        job: String,
        expression: String,
        detail: String,
    },
}

impl Event {
    /// Job the event concerns, if any.
    pub fn job(&self) -> Option<&str> {
        match self {
            Self::JobSucceeded { job, .. }
            | Self::JobFailed { job, .. }
            | Self::DestinationFull { job, .. }
            | Self::RetriesExhausted { job, .. }
            | Self::InvalidSchedule { job, .. } => Some(job),
            Self::ConfigError { .. } => None,
        }
    }

    /// One-line human readable description.
    pub fn message(&self) -> String {
        match self {
            Self::JobSucceeded { job, files, bytes } => format!(
                "Backup '{job}' completed: {files} files, {}",
                format_bytes(*bytes)
            ),
            Self::JobFailed {
                job,
                error,
                retry_at: Some(at),
                ..
            } => format!("Backup '{job}' failed: {error}. Retrying at {}", at.to_rfc3339()),
            Self::JobFailed { job, error, .. } => format!("Backup '{job}' failed: {error}"),
            Self::DestinationFull { job, destination } => {
                format!("Backup '{job}' stopped: destination {destination} is full")
            }
            Self::RetriesExhausted { job, failures } => format!(
                "Backup '{job}' failed {failures} times in a row, waiting for its next scheduled run"
            ),
            Self::ConfigError { detail } => format!("Configuration error: {detail}"),
            Self::InvalidSchedule {
                job,
                expression,
                detail,
            } => format!("Job '{job}' has an invalid schedule '{expression}': {detail}"),
        }
    }
}

/// Receives events. Delivery problems are the implementation's to swallow.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &Event) {
        let message = event.message();
        match event {
            Event::JobSucceeded { .. } => info!(job = ?event.job(), "{message}"),
            Event::JobFailed { .. } | Event::RetriesExhausted { .. } => {
                warn!(job = ?event.job(), "{message}")
            }
            Event::DestinationFull { .. }
            | Event::ConfigError { .. }
            | Event::InvalidSchedule { .. } => error!(job = ?event.job(), "{message}"),
        }
    }
}

/// Forwards every event to each registered notifier in order.
#[derive(Clone, Default)]
pub struct Notifiers {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.sinks.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Notifier for Notifiers {
    fn notify(&self, event: &Event) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl Notifier for Recorder {
        fn notify(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let notifiers = Notifiers::new()
            .with(Arc::new(LogNotifier))
            .with(a.clone())
            .with(b.clone());
        assert_eq!(notifiers.len(), 3);

        let event = Event::RetriesExhausted {
            job: "docs".into(),
            failures: 6,
        };
        notifiers.notify(&event);

        assert_eq!(*a.0.lock().unwrap(), vec![event.clone()]);
        assert_eq!(*b.0.lock().unwrap(), vec![event]);
    }

    #[test]
    fn test_messages() {
        let event = Event::JobSucceeded {
            job: "docs".into(),
            files: 3,
            bytes: 2048,
        };
        assert_eq!(event.message(), "Backup 'docs' completed: 3 files, 2.00 KiB");
        assert_eq!(event.job(), Some("docs"));

        let event = Event::ConfigError {
            detail: "duplicate job name: docs".into(),
        };
        assert_eq!(event.job(), None);
        assert!(event.message().contains("duplicate job name"));
    }
}
