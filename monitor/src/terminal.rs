//! Terminal state detection.
//!
//! The backend signals "done" in several redundant ways: a `final_result`
//! event, an `is_final` flag, a completion phrase in an ordinary message, a
//! `close` event, or a completed record on the polling endpoint. Any of them
//! is enough. [`TerminalDetector`] reports the first one that applies; the
//! session state machine makes sure only the first signal is acted on.

use crate::types::{EventEnvelope, EventType, JobRecord, JobStatus};

/// Message used when an error event carries no description.
const UNKNOWN_ERROR: &str = "unknown error";

/// Outcome of a terminal signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Completed,
    Failed,
}

impl TerminalKind {
    /// The job status this outcome moves the session to.
    #[must_use]
    pub fn job_status(self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }
}

/// What produced a terminal signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCause {
    /// An `error` event with its message.
    RemoteError(String),
    FinalResult,
    /// A payload flagged as the last event.
    FinalHint,
    /// A message whose text contained this completion phrase.
    CompletionPhrase(String),
    StreamClosed,
    /// A polled record reported a terminal status.
    PolledStatus { status: String, error: Option<String> },
}

/// A detected terminal condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSignal {
    pub kind: TerminalKind,
    pub cause: TerminalCause,
}

impl TerminalSignal {
    fn completed(cause: TerminalCause) -> Self {
        Self {
            kind: TerminalKind::Completed,
            cause,
        }
    }

    fn failed(cause: TerminalCause) -> Self {
        Self {
            kind: TerminalKind::Failed,
            cause,
        }
    }

    /// The failure description reported by the backend, for failed signals.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        if self.kind != TerminalKind::Failed {
            return None;
        }
        match &self.cause {
            TerminalCause::RemoteError(message) => Some(message.clone()),
            TerminalCause::PolledStatus { status, error } => Some(
                error
                    .clone()
                    .unwrap_or_else(|| format!("job reported status '{status}'")),
            ),
            _ => None,
        }
    }
}

/// OR-combined terminal checks over push events and polled records.
#[derive(Debug, Clone)]
pub struct TerminalDetector {
    completion_phrases: Vec<String>,
    completed_sentinels: Vec<String>,
    failed_sentinels: Vec<String>,
}

impl Default for TerminalDetector {
    fn default() -> Self {
        Self {
            completion_phrases: [
                "page analysis result storage complete",
                "storage complete",
                "result saved",
                "✅",
                "页面分析结果存储完成",
                "存储完成",
                "分析结果已保存",
            ]
            .iter()
            .map(|phrase| phrase.to_string())
            .collect(),
            completed_sentinels: vec!["completed".to_string()],
            failed_sentinels: vec!["failed".to_string(), "error".to_string()],
        }
    }
}

impl TerminalDetector {
    /// Replaces the completion phrases matched in message text.
    #[must_use]
    pub fn with_completion_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.completion_phrases = phrases
            .into_iter()
            .map(|phrase| phrase.into().to_lowercase())
            .collect();
        self
    }

    /// Replaces the polled status values treated as terminal.
    #[must_use]
    pub fn with_sentinels(mut self, completed: &[&str], failed: &[&str]) -> Self {
        self.completed_sentinels = completed.iter().map(|s| s.to_lowercase()).collect();
        self.failed_sentinels = failed.iter().map(|s| s.to_lowercase()).collect();
        self
    }

    /// Checks one decoded push event.
    ///
    /// `current` is the session's job status before the event; a `close`
    /// after a failure does not turn it into a completion.
    #[must_use]
    pub fn inspect(&self, envelope: &EventEnvelope, current: JobStatus) -> Option<TerminalSignal> {
        match envelope.event_type {
            EventType::Error => {
                let message = envelope.error_message().unwrap_or(UNKNOWN_ERROR);
                return Some(TerminalSignal::failed(TerminalCause::RemoteError(
                    message.to_string(),
                )));
            }
            EventType::FinalResult => {
                return Some(TerminalSignal::completed(TerminalCause::FinalResult));
            }
            _ => {}
        }

        if envelope.is_final_hint {
            return Some(TerminalSignal::completed(TerminalCause::FinalHint));
        }

        if envelope.event_type == EventType::Message {
            if let Some(phrase) = envelope.step_text().and_then(|text| self.completion_phrase(text))
            {
                return Some(TerminalSignal::completed(TerminalCause::CompletionPhrase(
                    phrase.to_string(),
                )));
            }
        }

        if envelope.event_type == EventType::Close && current != JobStatus::Failed {
            return Some(TerminalSignal::completed(TerminalCause::StreamClosed));
        }

        None
    }

    /// Checks polled records for the monitored session.
    ///
    /// Records for other sessions are ignored.
    #[must_use]
    pub fn inspect_records(&self, records: &[JobRecord], session_id: &str) -> Option<TerminalSignal> {
        records
            .iter()
            .filter(|record| record.session_id.as_deref() == Some(session_id))
            .find_map(|record| {
                let status = record.effective_status()?;
                let lowered = status.to_lowercase();
                let cause = || TerminalCause::PolledStatus {
                    status: status.to_string(),
                    error: record.error.clone(),
                };

                if self.completed_sentinels.contains(&lowered) {
                    Some(TerminalSignal::completed(cause()))
                } else if self.failed_sentinels.contains(&lowered) {
                    Some(TerminalSignal::failed(cause()))
                } else {
                    None
                }
            })
    }

    fn completion_phrase(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.completion_phrases
            .iter()
            .find(|phrase| lowered.contains(phrase.as_str()))
            .map(String::as_str)
    }
}
