//! Error types for the PageLens Monitor.
//!
//! This module defines the error taxonomy surfaced by a session monitor.
//! Parse-level failures ([`MalformedEventError`]) are always recovered inside
//! the monitor; the remaining variants reach subscribers exactly once through
//! `on_error`, or are returned to the caller of `stop_execution`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;
use crate::parser::MalformedEventError;
use crate::transport::TransportError;

/// Which deadline expired when a session was force-terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The push connection never opened.
    Connect(Duration),
    /// The session never reached a terminal state.
    Watchdog(Duration),
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(limit) => write!(
                f,
                "push connection did not open within {}s",
                limit.as_secs()
            ),
            Self::Watchdog(limit) => write!(
                f,
                "no terminal event within {}s",
                limit.as_secs()
            ),
        }
    }
}

/// Errors that can occur while monitoring a job session.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// A single push frame failed to parse.
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] MalformedEventError),

    /// The push connection failed, was refused, or ended early.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The backend reported that the job failed.
    #[error("job failed: {message}")]
    RemoteJob { message: String },

    /// No terminal signal arrived in time.
    #[error("timed out: {0}")]
    Timeout(TimeoutKind),

    /// The cancel request to the backend failed.
    ///
    /// Local teardown still happens when this is returned.
    #[error("failed to notify backend of cancellation: {0}")]
    CancelNotification(#[source] ApiError),
}

impl MonitorError {
    /// Human-readable reason recorded on the session snapshot.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::RemoteJob { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_job_display() {
        let err = MonitorError::RemoteJob {
            message: "model unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "job failed: model unavailable");
        assert_eq!(err.reason(), "model unavailable");
    }

    #[test]
    fn timeout_display_names_the_deadline() {
        let err = MonitorError::Timeout(TimeoutKind::Connect(Duration::from_secs(30)));
        assert_eq!(
            err.to_string(),
            "timed out: push connection did not open within 30s"
        );

        let err = MonitorError::Timeout(TimeoutKind::Watchdog(Duration::from_secs(300)));
        assert_eq!(err.to_string(), "timed out: no terminal event within 300s");
    }

    #[test]
    fn transport_error_conversion() {
        let err: MonitorError = TransportError::EndedEarly.into();
        assert!(matches!(err, MonitorError::Transport(TransportError::EndedEarly)));
        assert_eq!(
            err.reason(),
            "transport error: push stream ended before a terminal event"
        );
    }

    #[test]
    fn malformed_event_conversion() {
        let err: MonitorError = MalformedEventError::Empty.into();
        assert!(matches!(err, MonitorError::MalformedEvent(_)));
        assert!(err.to_string().starts_with("malformed event"));
    }

    #[test]
    fn cancel_notification_keeps_source() {
        use std::error::Error;

        let api_err = ApiError::ServerError {
            status: 404,
            message: "session not found".to_string(),
        };
        let err = MonitorError::CancelNotification(api_err);
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "failed to notify backend of cancellation: server error: 404 - session not found"
        );
    }

    #[test]
    fn result_type_alias_works() {
        fn example_function() -> Result<i32> {
            Ok(42)
        }

        fn example_error_function() -> Result<i32> {
            Err(MonitorError::RemoteJob {
                message: "boom".to_string(),
            })
        }

        assert!(example_function().is_ok());
        assert!(example_error_function().is_err());
    }
}
