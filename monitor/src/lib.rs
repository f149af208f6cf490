//! PageLens Monitor - streaming job monitor for the PageLens analysis backend.
//!
//! This crate follows long-running backend jobs (page screenshot analysis and
//! script execution) from submission to completion, and reports progress to
//! the caller as it happens.
//!
//! # Overview
//!
//! A job is submitted over REST and answered with a session id and a push
//! stream endpoint. A [`SessionMonitor`] then consumes the stream, turns free
//! text step descriptions into a monotonic progress value, and detects the
//! terminal state from any of several redundant signals. A polling fallback
//! runs alongside the stream, so a stalled or truncated stream still ends in
//! a definite outcome. Every session is torn down after it completes, fails,
//! times out, or is stopped, and no timer outlives it.
//!
//! # Modules
//!
//! - [`types`]: Session, event and record types
//! - [`sse`]: Incremental Server-Sent Events decoder
//! - [`parser`]: Push event decoding
//! - [`progress`]: Progress estimation from step text
//! - [`terminal`]: Terminal state detection
//! - [`timers`]: Per-session timer set
//! - [`transport`]: Push transport trait and HTTP implementation
//! - [`api`]: REST client for submission, polling and cancellation
//! - [`polling`]: In-flight fallback requests
//! - [`monitor`]: The session monitor
//! - [`registry`]: Handles of running monitors
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations

pub mod api;
pub mod config;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod polling;
pub mod progress;
pub mod registry;
pub mod sse;
pub mod terminal;
pub mod timers;
pub mod transport;
pub mod types;

pub use api::{ApiError, HttpJobApi, JobApi, JobKind};
pub use config::{Config, ConfigError, MonitorTimings};
pub use error::{MonitorError, Result, TimeoutKind};
pub use monitor::{MonitorHandle, SessionMonitor};
pub use parser::{parse_event, MalformedEventError};
pub use progress::ProgressHeuristic;
pub use registry::MonitorRegistry;
pub use terminal::{TerminalDetector, TerminalKind, TerminalSignal};
pub use transport::{HttpPushTransport, PushTransport, TransportError};
pub use types::{
    ConnectionState, EventEnvelope, EventType, JobHandle, JobRecord, JobStatus, MonitorMessage,
    SessionSnapshot,
};
