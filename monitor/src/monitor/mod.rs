//! Session monitor.
//!
//! A [`SessionMonitor`] follows one backend job from submission to a terminal
//! state. It consumes the push stream, estimates progress from step text,
//! polls the REST API as a fallback, and notifies subscribers exactly once
//! when the job completes or fails. Teardown always follows a terminal
//! transition, after a short grace delay.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pagelens_monitor::api::{HttpJobApi, JobKind};
//! use pagelens_monitor::monitor::SessionMonitor;
//! use pagelens_monitor::transport::HttpPushTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let api = HttpJobApi::new("http://localhost:8000", JobKind::PageAnalysis, Duration::from_secs(30))
//!         .unwrap();
//!     let transport = HttpPushTransport::new(
//!         "http://localhost:8000",
//!         api.routes().stream.clone(),
//!         Duration::from_secs(30),
//!     )
//!     .unwrap();
//!
//!     let mut monitor = SessionMonitor::new("a1b2", Arc::new(transport), Arc::new(api))
//!         .on_message(|message| println!("{}% {:?}", message.progress, message.content))
//!         .on_complete(|| println!("done"));
//!
//!     monitor.start();
//!     monitor.closed().await;
//! }
//! ```

mod driver;
mod state;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::JobApi;
use crate::config::MonitorTimings;
use crate::error::{MonitorError, Result};
use crate::polling::PollingFallback;
use crate::progress::ProgressHeuristic;
use crate::terminal::TerminalDetector;
use crate::transport::PushTransport;
use crate::types::{ConnectionState, JobRecord, JobStatus, MonitorMessage, SessionSnapshot};

use driver::{Callbacks, Command, Driver};
use state::SessionState;

/// Monitors one job session.
///
/// Configure with the consuming `with_*` and `on_*` builders, then call
/// [`start`](Self::start) from within a tokio runtime. Callbacks run on the
/// monitor's own task, one at a time.
pub struct SessionMonitor {
    session_id: String,
    transport: Arc<dyn PushTransport>,
    api: Arc<dyn JobApi>,
    timings: MonitorTimings,
    heuristic: ProgressHeuristic,
    detector: TerminalDetector,
    callbacks: Option<Callbacks>,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("session_id", &self.session_id)
            .field("timings", &self.timings)
            .field("started", &self.commands.is_some())
            .field("snapshot", &*self.snapshot_tx.borrow())
            .finish()
    }
}

impl SessionMonitor {
    /// Creates an idle monitor for `session_id`.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        transport: Arc<dyn PushTransport>,
        api: Arc<dyn JobApi>,
    ) -> Self {
        let session_id = session_id.into();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::new(session_id.clone()));

        Self {
            session_id,
            transport,
            api,
            timings: MonitorTimings::default(),
            heuristic: ProgressHeuristic::default(),
            detector: TerminalDetector::default(),
            callbacks: Some(Callbacks::default()),
            snapshot_tx: Arc::new(snapshot_tx),
            commands: None,
            driver: None,
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: MonitorTimings) -> Self {
        self.timings = timings;
        self
    }

    #[must_use]
    pub fn with_heuristic(mut self, heuristic: ProgressHeuristic) -> Self {
        self.heuristic = heuristic;
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: TerminalDetector) -> Self {
        self.detector = detector;
        self
    }

    fn callbacks_mut(&mut self) -> Option<&mut Callbacks> {
        if self.callbacks.is_none() {
            warn!(session_id = %self.session_id, "Callback registered after start is ignored");
        }
        self.callbacks.as_mut()
    }

    /// Receives every accepted event, including the terminal one.
    #[must_use]
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&MonitorMessage) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks_mut() {
            callbacks.on_message = Some(Box::new(callback));
        }
        self
    }

    /// Receives each job status change.
    #[must_use]
    pub fn on_status_change<F>(mut self, callback: F) -> Self
    where
        F: FnMut(JobStatus) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks_mut() {
            callbacks.on_status_change = Some(Box::new(callback));
        }
        self
    }

    /// Receives status strings pushed by the backend in `status` updates.
    ///
    /// These are passed through as sent and do not change the session's own
    /// [`JobStatus`].
    #[must_use]
    pub fn on_reported_status<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks_mut() {
            callbacks.on_reported_status = Some(Box::new(callback));
        }
        self
    }

    /// Receives the failure that ended the session. Fires at most once.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&MonitorError) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks_mut() {
            callbacks.on_error = Some(Box::new(callback));
        }
        self
    }

    /// Called when the job completes. Fires at most once.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks_mut() {
            callbacks.on_complete = Some(Box::new(callback));
        }
        self
    }

    /// Receives the job listing each time it is refreshed.
    #[must_use]
    pub fn on_list_refresh<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[JobRecord]) + Send + 'static,
    {
        if let Some(callbacks) = self.callbacks_mut() {
            callbacks.on_list_refresh = Some(Box::new(callback));
        }
        self
    }

    /// The monitored session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Starts connecting. Calling it again, or after `stop`, does nothing.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(&mut self) {
        if self.commands.is_some() || self.snapshot_tx.borrow().is_closed() {
            debug!(session_id = %self.session_id, "Monitor already started");
            return;
        }
        let Some(callbacks) = self.callbacks.take() else {
            return;
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = SessionState::new(
            self.session_id.clone(),
            self.heuristic.clone(),
            self.detector.clone(),
        );
        let driver = Driver::new(
            state,
            Arc::clone(&self.transport),
            PollingFallback::new(Arc::clone(&self.api), self.session_id.clone()),
            self.timings,
            callbacks,
            Arc::clone(&self.snapshot_tx),
            command_rx,
        );

        self.driver = Some(tokio::spawn(driver.run()));
        self.commands = Some(command_tx);
    }

    /// Tears the session down immediately. Safe to call repeatedly.
    ///
    /// When this returns no timer or callback of this monitor can run.
    pub async fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            request_stop(&commands).await;
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!(session_id = %self.session_id, error = %e, "Monitor task ended abnormally");
            }
        }
        // Never started, or the task died without closing.
        mark_closed(&self.snapshot_tx);
    }

    /// Asks the backend to cancel the job, then stops locally.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::CancelNotification`] if the cancel request
    /// failed. Local teardown happens either way.
    pub async fn stop_execution(&mut self) -> Result<()> {
        let notified = self.api.cancel(&self.session_id).await;
        self.stop().await;
        notified.map_err(MonitorError::CancelNotification)
    }

    /// Current state of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribes to snapshot changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        wait_closed(&self.snapshot_tx).await;
    }

    /// A cloneable handle to the running monitor, or `None` before `start`.
    #[must_use]
    pub fn handle(&self) -> Option<MonitorHandle> {
        self.commands.as_ref().map(|commands| MonitorHandle {
            session_id: self.session_id.clone(),
            commands: commands.clone(),
            snapshot_tx: Arc::clone(&self.snapshot_tx),
            api: Arc::clone(&self.api),
        })
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let (ack, _) = oneshot::channel();
            let _ = commands.send(Command::Stop { ack });
        }
    }
}

/// Cloneable control handle for a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    api: Arc<dyn JobApi>,
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl MonitorHandle {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Tears the session down and waits until teardown has finished.
    pub async fn stop(&self) {
        request_stop(&self.commands).await;
        mark_closed(&self.snapshot_tx);
    }

    /// Asks the backend to cancel the job, then stops locally.
    ///
    /// # Errors
    ///
    /// See [`SessionMonitor::stop_execution`].
    pub async fn stop_execution(&self) -> Result<()> {
        let notified = self.api.cancel(&self.session_id).await;
        self.stop().await;
        notified.map_err(MonitorError::CancelNotification)
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.snapshot_tx.borrow().is_closed()
    }

    pub async fn closed(&self) {
        wait_closed(&self.snapshot_tx).await;
    }
}

async fn request_stop(commands: &mpsc::UnboundedSender<Command>) {
    let (ack, done) = oneshot::channel();
    if commands.send(Command::Stop { ack }).is_ok() {
        // An error means the driver exited on its own after teardown.
        let _ = done.await;
    }
}

fn mark_closed(snapshot_tx: &watch::Sender<SessionSnapshot>) {
    snapshot_tx.send_if_modified(|snapshot| {
        if snapshot.is_closed() {
            return false;
        }
        snapshot.connection_state = ConnectionState::Closed;
        snapshot.pending_timers = 0;
        true
    });
}

async fn wait_closed(snapshot_tx: &watch::Sender<SessionSnapshot>) {
    let mut rx = snapshot_tx.subscribe();
    // The sender outlives this call, so the wait cannot fail.
    let _ = rx.wait_for(SessionSnapshot::is_closed).await;
}
