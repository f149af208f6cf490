//! The per-session driver task.
//!
//! One tokio task per monitor owns the connection, the timers, the polling
//! requests and the [`SessionState`]. It multiplexes them with `select!` and
//! runs every transition and callback itself, so callbacks for one session
//! never overlap and the task exits only after teardown.

use std::future::pending;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::state::{Effect, SessionState};
use crate::config::MonitorTimings;
use crate::error::{MonitorError, TimeoutKind};
use crate::parser::parse_frame;
use crate::polling::{PollOutcome, PollingFallback};
use crate::sse::RawFrame;
use crate::terminal::TerminalKind;
use crate::timers::{TimerEvent, TimerSet};
use crate::transport::{FrameStream, PushTransport, TransportError};
use crate::types::{JobRecord, JobStatus, MonitorMessage, SessionSnapshot};

pub(crate) type MessageCallback = Box<dyn FnMut(&MonitorMessage) + Send>;
pub(crate) type StatusCallback = Box<dyn FnMut(JobStatus) + Send>;
pub(crate) type ReportedStatusCallback = Box<dyn FnMut(&str) + Send>;
pub(crate) type ErrorCallback = Box<dyn FnMut(&MonitorError) + Send>;
pub(crate) type CompleteCallback = Box<dyn FnMut() + Send>;
pub(crate) type ListCallback = Box<dyn FnMut(&[JobRecord]) + Send>;

/// Subscriber callbacks; each slot holds the last registration.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_status_change: Option<StatusCallback>,
    pub(crate) on_reported_status: Option<ReportedStatusCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_complete: Option<CompleteCallback>,
    pub(crate) on_list_refresh: Option<ListCallback>,
}

/// Requests sent to a running driver.
#[derive(Debug)]
pub(crate) enum Command {
    /// Tear down now; `ack` fires once teardown is complete.
    Stop { ack: oneshot::Sender<()> },
}

type ConnectFuture = BoxFuture<'static, Result<FrameStream, TransportError>>;

enum Step {
    Command(Option<Command>),
    Timer(TimerEvent),
    Connected(Result<FrameStream, TransportError>),
    Frame(Option<Result<RawFrame, TransportError>>),
    Poll(PollOutcome),
}

pub(crate) struct Driver {
    session_id: String,
    state: SessionState,
    transport: Arc<dyn PushTransport>,
    polling: PollingFallback,
    timers: TimerSet,
    timings: MonitorTimings,
    callbacks: Callbacks,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    commands: mpsc::UnboundedReceiver<Command>,
    connecting: Option<ConnectFuture>,
    stream: Option<FrameStream>,
}

async fn settle(connecting: &mut Option<ConnectFuture>) -> Result<FrameStream, TransportError> {
    match connecting.as_mut() {
        Some(fut) => {
            let result = fut.await;
            *connecting = None;
            result
        }
        None => pending().await,
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<RawFrame, TransportError>> {
    match stream.as_mut() {
        Some(frames) => frames.next().await,
        None => pending().await,
    }
}

impl Driver {
    pub(crate) fn new(
        state: SessionState,
        transport: Arc<dyn PushTransport>,
        polling: PollingFallback,
        timings: MonitorTimings,
        callbacks: Callbacks,
        snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            session_id: state.snapshot().session_id.clone(),
            state,
            transport,
            polling,
            timers: TimerSet::new(),
            timings,
            callbacks,
            snapshot_tx,
            commands,
            connecting: None,
            stream: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let effects = self.state.begin_connecting();
        self.dispatch(effects);

        self.timers.arm_connect_deadline(self.timings.connect_timeout);
        self.timers.arm_watchdog(self.timings.watchdog);
        self.timers.arm_polling(
            self.timings.poll_interval,
            self.timings.list_refresh_interval,
            self.timings.poll_ceiling,
        );

        let transport = Arc::clone(&self.transport);
        let session_id = self.session_id.clone();
        self.connecting = Some(async move { transport.connect(&session_id).await }.boxed());

        info!(session_id = %self.session_id, "Session monitor started");
        self.publish();

        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                event = self.timers.next() => Step::Timer(event),
                result = settle(&mut self.connecting) => Step::Connected(result),
                frame = next_frame(&mut self.stream) => Step::Frame(frame),
                outcome = self.polling.next() => Step::Poll(outcome),
            };

            match step {
                Step::Command(Some(Command::Stop { ack })) => {
                    info!(session_id = %self.session_id, "Stop requested");
                    self.teardown();
                    let _ = ack.send(());
                    return;
                }
                Step::Command(None) => {
                    debug!(session_id = %self.session_id, "All monitor handles dropped");
                    self.teardown();
                    return;
                }
                Step::Timer(TimerEvent::Teardown) => {
                    self.teardown();
                    return;
                }
                Step::Timer(event) => self.on_timer(event),
                Step::Connected(result) => self.on_connected(result),
                Step::Frame(frame) => self.on_frame(frame),
                Step::Poll(outcome) => self.on_poll(outcome),
            }

            self.publish();
        }
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ConnectDeadline => {
                self.connecting = None;
                warn!(session_id = %self.session_id, "Push connection did not open in time");
                self.fail(MonitorError::Timeout(TimeoutKind::Connect(
                    self.timings.connect_timeout,
                )));
            }
            TimerEvent::Watchdog => {
                warn!(session_id = %self.session_id, "Session watchdog expired");
                self.fail(MonitorError::Timeout(TimeoutKind::Watchdog(
                    self.timings.watchdog,
                )));
            }
            TimerEvent::StatusPoll => {
                if !self.polling.begin_status_check() {
                    debug!(session_id = %self.session_id, "Status poll still in flight, skipping tick");
                }
            }
            TimerEvent::ListRefresh => {
                if !self.polling.begin_list_refresh() {
                    debug!(session_id = %self.session_id, "List refresh still in flight, skipping tick");
                }
            }
            TimerEvent::PollCeiling => {
                debug!(session_id = %self.session_id, "Polling window closed");
            }
            // Handled by the run loop.
            TimerEvent::Teardown => {}
        }
    }

    fn on_connected(&mut self, result: Result<FrameStream, TransportError>) {
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.timers.cancel_connect_deadline();
                info!(session_id = %self.session_id, "Push connection open");
                let effects = self.state.connection_opened();
                self.dispatch(effects);
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Failed to open push connection");
                self.fail(MonitorError::Transport(e));
            }
        }
    }

    fn on_frame(&mut self, frame: Option<Result<RawFrame, TransportError>>) {
        match frame {
            Some(Ok(frame)) => match parse_frame(&frame) {
                Ok(envelope) => {
                    let effects = self.state.apply_envelope(envelope);
                    self.dispatch(effects);
                }
                Err(e) => {
                    let err = MonitorError::from(e);
                    warn!(
                        session_id = %self.session_id,
                        error = %err,
                        event = frame.event.as_deref().unwrap_or("message"),
                        "Dropping malformed push event"
                    );
                }
            },
            Some(Err(e)) => {
                self.stream = None;
                error!(session_id = %self.session_id, error = %e, "Push stream failed");
                self.fail(MonitorError::Transport(e));
            }
            None => {
                self.stream = None;
                if self.state.snapshot().terminal_fired {
                    debug!(session_id = %self.session_id, "Push stream closed");
                } else {
                    error!(session_id = %self.session_id, "Push stream ended before a terminal event");
                    self.fail(MonitorError::Transport(TransportError::EndedEarly));
                }
            }
        }
    }

    fn on_poll(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Status(Ok(records)) => {
                let effects = self.state.apply_records(&records);
                self.dispatch(effects);
            }
            PollOutcome::Status(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "Status poll failed");
            }
            PollOutcome::Listing(Ok(records)) => {
                debug!(session_id = %self.session_id, count = records.len(), "Job list refreshed");
                if let Some(callback) = self.callbacks.on_list_refresh.as_mut() {
                    callback(&records);
                }
            }
            PollOutcome::Listing(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "List refresh failed");
            }
        }
    }

    fn fail(&mut self, error: MonitorError) {
        let effects = self.state.fail(error);
        self.dispatch(effects);
    }

    fn dispatch(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Message(message) => {
                    if let Some(callback) = self.callbacks.on_message.as_mut() {
                        callback(&message);
                    }
                }
                Effect::Status(status) => {
                    debug!(session_id = %self.session_id, status = %status, "Job status changed");
                    if let Some(callback) = self.callbacks.on_status_change.as_mut() {
                        callback(status);
                    }
                }
                Effect::ReportedStatus(status) => {
                    debug!(session_id = %self.session_id, reported = %status, "Backend reported status");
                    if let Some(callback) = self.callbacks.on_reported_status.as_mut() {
                        callback(&status);
                    }
                }
                Effect::Complete => {
                    info!(session_id = %self.session_id, "Job completed");
                    if let Some(callback) = self.callbacks.on_complete.as_mut() {
                        callback();
                    }
                }
                Effect::Error(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Job failed");
                    if let Some(callback) = self.callbacks.on_error.as_mut() {
                        callback(&e);
                    }
                }
                Effect::ScheduleTeardown(kind) => self.schedule_teardown(kind),
            }
        }
    }

    fn schedule_teardown(&mut self, kind: TerminalKind) {
        self.connecting = None;
        self.polling.cancel();
        self.timers.cancel_connect_deadline();
        self.timers.cancel_watchdog();
        self.timers.cancel_polling();

        let grace = match kind {
            TerminalKind::Completed => self.timings.grace_delay,
            TerminalKind::Failed => self.timings.failure_grace_delay,
        };
        self.timers.arm_teardown(grace);
        info!(
            session_id = %self.session_id,
            grace_ms = grace.as_millis() as u64,
            "Teardown scheduled"
        );
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.connecting = None;
        self.polling.cancel();
        self.timers.clear();
        if self.state.close() {
            info!(session_id = %self.session_id, "Session closed");
        }
        self.publish();
    }

    fn publish(&mut self) {
        self.state.set_pending_timers(self.timers.pending());
        let snapshot = self.state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if current == snapshot {
                false
            } else {
                current.clone_from(snapshot);
                true
            }
        });
    }
}
