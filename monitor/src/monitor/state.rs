//! Pure session state transitions.
//!
//! [`SessionState`] owns the snapshot and applies inputs (connection opened,
//! decoded events, polled records, failures) to it. Each transition returns
//! the [`Effect`]s the driver must carry out, in order. Keeping this free of
//! I/O and timers makes the single-fire guard easy to test in isolation.

use chrono::Utc;
use tracing::{debug, trace};

use crate::error::MonitorError;
use crate::progress::ProgressHeuristic;
use crate::terminal::{TerminalDetector, TerminalKind, TerminalSignal};
use crate::types::{
    ConnectionState, EventEnvelope, EventType, JobRecord, JobStatus, MonitorMessage,
    SessionSnapshot,
};

/// Progress reported once the push connection is open.
const CONNECTED_PROGRESS: u8 = 10;

/// Work for the driver produced by a transition.
#[derive(Debug)]
pub(crate) enum Effect {
    Message(MonitorMessage),
    Status(JobStatus),
    /// Status string forwarded verbatim from a backend status update.
    ReportedStatus(String),
    Complete,
    Error(MonitorError),
    ScheduleTeardown(TerminalKind),
}

#[derive(Debug)]
pub(crate) struct SessionState {
    snapshot: SessionSnapshot,
    heuristic: ProgressHeuristic,
    detector: TerminalDetector,
}

impl SessionState {
    pub(crate) fn new(
        session_id: impl Into<String>,
        heuristic: ProgressHeuristic,
        detector: TerminalDetector,
    ) -> Self {
        Self {
            snapshot: SessionSnapshot::new(session_id),
            heuristic,
            detector,
        }
    }

    pub(crate) fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub(crate) fn set_pending_timers(&mut self, pending: usize) {
        self.snapshot.pending_timers = pending;
    }

    fn is_settled(&self) -> bool {
        self.snapshot.terminal_fired || self.snapshot.is_closed()
    }

    fn set_status(&mut self, status: JobStatus, effects: &mut Vec<Effect>) {
        if self.snapshot.job_status != status {
            self.snapshot.job_status = status;
            effects.push(Effect::Status(status));
        }
    }

    /// `idle -> connecting`.
    pub(crate) fn begin_connecting(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.snapshot.connection_state != ConnectionState::Idle {
            return effects;
        }
        self.snapshot.connection_state = ConnectionState::Connecting;
        self.set_status(JobStatus::Connecting, &mut effects);
        effects
    }

    /// `connecting -> open`.
    pub(crate) fn connection_opened(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.snapshot.is_closed() {
            return effects;
        }
        self.snapshot.connection_state = ConnectionState::Open;
        if self.snapshot.terminal_fired {
            return effects;
        }
        self.snapshot.progress = self.snapshot.progress.max(CONNECTED_PROGRESS);
        self.set_status(JobStatus::Analyzing, &mut effects);
        effects
    }

    /// Applies one decoded push event.
    pub(crate) fn apply_envelope(&mut self, envelope: EventEnvelope) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_settled() {
            trace!(
                session_id = %self.snapshot.session_id,
                event_type = %envelope.event_type,
                "Ignoring event after terminal state"
            );
            return effects;
        }

        let reported = envelope.reported_status().map(str::to_string);

        match envelope.event_type {
            EventType::Ping => {
                trace!(session_id = %self.snapshot.session_id, "Heartbeat");
                return effects;
            }
            EventType::Unknown(_) if reported.is_some() => {
                effects.extend(reported.map(Effect::ReportedStatus));
                return effects;
            }
            EventType::Unknown(ref name) => {
                debug!(session_id = %self.snapshot.session_id, event_type = %name, "Ignoring unknown event type");
                return effects;
            }
            _ => {}
        }

        let signal = self.detector.inspect(&envelope, self.snapshot.job_status);

        let content = envelope.step_text().map(str::to_string);
        if let Some(text) = content.as_deref() {
            if envelope.event_type == EventType::Message {
                self.snapshot.progress = self.heuristic.estimate(self.snapshot.progress, text);
            }
            self.snapshot.last_step_description = Some(text.to_string());
        }

        if matches!(signal, Some(TerminalSignal { kind: TerminalKind::Completed, .. })) {
            self.snapshot.progress = 100;
        }

        debug!(
            session_id = %self.snapshot.session_id,
            event_type = %envelope.event_type,
            progress = self.snapshot.progress,
            "Applied push event"
        );

        effects.push(Effect::Message(MonitorMessage {
            event_type: envelope.event_type,
            session_id: self.snapshot.session_id.clone(),
            content,
            payload: envelope.payload,
            progress: self.snapshot.progress,
            received_at: Utc::now(),
        }));
        effects.extend(reported.map(Effect::ReportedStatus));

        if let Some(signal) = signal {
            self.finish(signal, &mut effects);
        }
        effects
    }

    /// Applies records from a fallback status poll.
    pub(crate) fn apply_records(&mut self, records: &[JobRecord]) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_settled() {
            return effects;
        }
        if let Some(signal) = self
            .detector
            .inspect_records(records, &self.snapshot.session_id)
        {
            debug!(session_id = %self.snapshot.session_id, cause = ?signal.cause, "Poll detected terminal state");
            self.finish(signal, &mut effects);
        }
        effects
    }

    /// Force-fails the session (transport failure or timeout).
    pub(crate) fn fail(&mut self, error: MonitorError) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.is_settled() {
            return effects;
        }
        self.snapshot.terminal_fired = true;
        self.snapshot.error_reason = Some(error.reason());
        self.set_status(JobStatus::Failed, &mut effects);
        effects.push(Effect::Error(error));
        effects.push(Effect::ScheduleTeardown(TerminalKind::Failed));
        effects
    }

    /// Marks the session closed. Returns false if it already was.
    pub(crate) fn close(&mut self) -> bool {
        if self.snapshot.is_closed() {
            return false;
        }
        self.snapshot.connection_state = ConnectionState::Closed;
        self.snapshot.pending_timers = 0;
        true
    }

    fn finish(&mut self, signal: TerminalSignal, effects: &mut Vec<Effect>) {
        self.snapshot.terminal_fired = true;
        if signal.kind == TerminalKind::Completed {
            self.snapshot.progress = 100;
        }
        let failure = (signal.kind == TerminalKind::Failed)
            .then(|| signal.failure_message().unwrap_or_default());
        if failure.is_some() {
            self.snapshot.error_reason.clone_from(&failure);
        }
        self.set_status(signal.kind.job_status(), effects);
        match failure {
            None => effects.push(Effect::Complete),
            Some(message) => effects.push(Effect::Error(MonitorError::RemoteJob { message })),
        }
        effects.push(Effect::ScheduleTeardown(signal.kind));
    }
}
