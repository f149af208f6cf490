//! Shared fixtures for monitor integration tests.
//!
//! In-memory transports and a fake job API, so sessions can be driven frame by
//! frame under a paused tokio clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use pagelens_monitor::api::{ApiError, JobApi};
use pagelens_monitor::monitor::SessionMonitor;
use pagelens_monitor::sse::RawFrame;
use pagelens_monitor::transport::{FrameStream, PushTransport, TransportError};
use pagelens_monitor::types::{EventType, JobRecord, JobStatus};

pub const SESSION_ID: &str = "sess-1";

// =============================================================================
// Transports
// =============================================================================

type FrameItem = Result<RawFrame, TransportError>;

/// Transport whose single stream is fed by a [`Feed`].
pub struct ScriptedTransport {
    frames: Mutex<Option<mpsc::UnboundedReceiver<FrameItem>>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            frames: Mutex::new(Some(rx)),
            connects: AtomicUsize::new(0),
        });
        (transport, Feed { tx: Some(tx) })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self, _session_id: &str) -> Result<FrameStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .frames
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Connect("already connected".to_string()))?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Producer side of a [`ScriptedTransport`] stream.
pub struct Feed {
    tx: Option<mpsc::UnboundedSender<FrameItem>>,
}

impl Feed {
    /// Sends a frame with an explicit event name and raw data.
    pub fn raw(&self, event: &str, data: &str) {
        self.send(Ok(RawFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
            id: None,
        }));
    }

    pub fn event(&self, event: &str, payload: Value) {
        self.raw(event, &payload.to_string());
    }

    /// Sends a `message` event carrying step text.
    pub fn step(&self, content: &str) {
        self.event("message", json!({ "content": content }));
    }

    pub fn fail(&self, error: TransportError) {
        self.send(Err(error));
    }

    /// Closes the stream cleanly.
    pub fn end(&mut self) {
        self.tx = None;
    }

    fn send(&self, item: FrameItem) {
        if let Some(tx) = &self.tx {
            // The monitor may already have dropped the stream.
            let _ = tx.send(item);
        }
    }
}

/// Transport whose connection never opens.
pub struct NeverOpens;

#[async_trait]
impl PushTransport for NeverOpens {
    async fn connect(&self, _session_id: &str) -> Result<FrameStream, TransportError> {
        std::future::pending().await
    }
}

/// Transport that is always turned away by the server.
pub struct Refusing;

#[async_trait]
impl PushTransport for Refusing {
    async fn connect(&self, _session_id: &str) -> Result<FrameStream, TransportError> {
        Err(TransportError::Rejected {
            status: 503,
            body: "stream unavailable".to_string(),
        })
    }
}

// =============================================================================
// Job API
// =============================================================================

/// Job API returning configurable records and counting calls.
#[derive(Default)]
pub struct FakeJobApi {
    records: Mutex<Vec<JobRecord>>,
    fail_cancel: AtomicBool,
    pub polls: AtomicUsize,
    pub listings: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl FakeJobApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_records(&self, records: Vec<JobRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn fail_cancel(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobApi for FakeJobApi {
    async fn poll_records(&self, _session_id: &str) -> Result<Vec<JobRecord>, ApiError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.lock().unwrap().clone())
    }

    async fn list_records(&self) -> Result<Vec<JobRecord>, ApiError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.lock().unwrap().clone())
    }

    async fn cancel(&self, _session_id: &str) -> Result<(), ApiError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError {
                status: 404,
                message: "session not found".to_string(),
            });
        }
        Ok(())
    }
}

/// A record for `session_id` with the given status.
pub fn record(session_id: &str, status: &str) -> JobRecord {
    JobRecord {
        session_id: Some(session_id.to_string()),
        status: Some(status.to_string()),
        ..JobRecord::default()
    }
}

// =============================================================================
// Callback recorder
// =============================================================================

/// Something a monitor reported through a callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Message { event_type: EventType, progress: u8 },
    Status(JobStatus),
    Reported(String),
    Error(String),
    Complete,
    Listing(usize),
}

/// Collects callback invocations in order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every callback on `monitor`.
    pub fn attach(&self, monitor: SessionMonitor) -> SessionMonitor {
        let messages = self.clone();
        let statuses = self.clone();
        let reported = self.clone();
        let errors = self.clone();
        let completes = self.clone();
        let listings = self.clone();

        monitor
            .on_message(move |message| {
                messages.push(Seen::Message {
                    event_type: message.event_type.clone(),
                    progress: message.progress,
                })
            })
            .on_status_change(move |status| statuses.push(Seen::Status(status)))
            .on_reported_status(move |status| reported.push(Seen::Reported(status.to_string())))
            .on_error(move |e| errors.push(Seen::Error(e.reason())))
            .on_complete(move || completes.push(Seen::Complete))
            .on_list_refresh(move |records| listings.push(Seen::Listing(records.len())))
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }

    pub fn all(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Message { progress, .. } => Some(progress),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn reported(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Reported(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Error(reason) => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.all()
            .into_iter()
            .filter(|seen| *seen == Seen::Complete)
            .count()
    }
}

/// Lets the monitor task process what is queued, advancing the paused clock
/// by a millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
