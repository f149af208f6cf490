//! Shared types for PageLens job monitoring.
//!
//! This module defines the session state model, the decoded push envelope,
//! the normalized message handed to subscribers, and the REST records used by
//! the polling fallback. Wire-facing types serialize to snake_case JSON to match
//! the backend.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Lifecycle of the push connection owned by a monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Status of the monitored backend job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Connecting,
    Analyzing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the snake_case wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named push event types.
///
/// The set is open: names the monitor does not understand are carried as
/// [`EventType::Unknown`] and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Session,
    Message,
    FinalResult,
    Close,
    Error,
    Ping,
    Unknown(String),
}

impl EventType {
    /// Maps a transport event name to an event type.
    ///
    /// An empty name is the SSE default (`message`); `heartbeat` is an alias
    /// for `ping`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "" | "message" => Self::Message,
            "session" => Self::Session,
            "final_result" => Self::FinalResult,
            "close" => Self::Close,
            "error" => Self::Error,
            "ping" | "heartbeat" => Self::Ping,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Session => "session",
            Self::Message => "message",
            Self::FinalResult => "final_result",
            Self::Close => "close",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A single decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Classification of the event.
    pub event_type: EventType,

    /// Decoded JSON payload.
    pub payload: Value,

    /// True when the payload itself marks this as the last event.
    pub is_final_hint: bool,

    /// Transport event id, when the frame carried one.
    pub id: Option<String>,
}

impl EventEnvelope {
    /// Free-text step description carried in `content`.
    #[must_use]
    pub fn step_text(&self) -> Option<&str> {
        self.payload.get("content").and_then(Value::as_str)
    }

    /// Failure description for `error` events.
    ///
    /// Falls back from `message` to `error` to `content`, since the backend
    /// uses all three.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        ["message", "error", "content"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
            .filter(|message| !message.trim().is_empty())
    }

    /// Backend-reported status string of a status update.
    ///
    /// Present when the payload is typed `status`, either through its own
    /// `type` field or the transport event name.
    #[must_use]
    pub fn reported_status(&self) -> Option<&str> {
        let is_status = matches!(&self.event_type, EventType::Unknown(name) if name == "status")
            || self.payload.get("type").and_then(Value::as_str) == Some("status");
        if !is_status {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The `result` object of a `final_result` event.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.payload.get("result").filter(|value| !value.is_null())
    }
}

/// Observable state of one monitored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub connection_state: ConnectionState,
    pub job_status: JobStatus,
    /// 0-100, never decreases within a session.
    pub progress: u8,
    pub last_step_description: Option<String>,
    /// Set once completion or error handling has run.
    pub terminal_fired: bool,
    pub error_reason: Option<String>,
    /// Number of armed timers; zero once the session is closed.
    pub pending_timers: usize,
}

impl SessionSnapshot {
    /// Creates the idle snapshot for a new session.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connection_state: ConnectionState::Idle,
            job_status: JobStatus::Pending,
            progress: 0,
            last_step_description: None,
            terminal_fired: false,
            error_reason: None,
            pending_timers: 0,
        }
    }

    /// Returns true once teardown has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection_state == ConnectionState::Closed
    }
}

/// Normalized message delivered to the message subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorMessage {
    /// Event type as reported by the transport.
    #[serde(rename = "type")]
    pub event_type: EventType,

    pub session_id: String,

    /// Step text, if the event carried one.
    pub content: Option<String>,

    /// The full decoded payload.
    pub payload: Value,

    /// Session progress after this event was applied.
    pub progress: u8,

    pub received_at: DateTime<Utc>,
}

/// A job record returned by a poll or list endpoint.
///
/// Page-analysis listings report `analysis_status` next to a display `status`;
/// script sessions report only `status`. See [`JobRecord::effective_status`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub id: Option<Value>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub analysis_status: Option<String>,

    #[serde(default)]
    pub page_name: Option<String>,

    #[serde(default, alias = "error_message")]
    pub error: Option<String>,

    /// Remaining fields, kept for list views.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    /// The status used for terminal detection.
    #[must_use]
    pub fn effective_status(&self) -> Option<&str> {
        self.analysis_status
            .as_deref()
            .or(self.status.as_deref())
            .map(str::trim)
            .filter(|status| !status.is_empty())
    }
}

/// Response of a job submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub session_id: String,

    /// Push stream path or absolute URL.
    #[serde(rename = "sse_endpoint")]
    pub stream_endpoint: String,

    #[serde(default)]
    pub status_endpoint: Option<String>,
}
