//! Push transport for job progress streams.
//!
//! The monitor only sees the [`PushTransport`] trait: "open a stream for this
//! session and hand me frames". [`HttpPushTransport`] is the production
//! implementation over an HTTP Server-Sent Events response; tests substitute
//! scripted transports.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::sse::{RawFrame, SseDecoder};
use crate::types::JobHandle;

/// Placeholder replaced with the session id in endpoint templates.
pub const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

/// Errors raised by a push transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request could not be sent or no response arrived.
    #[error("failed to open push stream: {0}")]
    Connect(String),

    /// The server answered with a non-success status.
    #[error("push stream rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Reading from an open stream failed.
    #[error("push stream read failed: {0}")]
    Read(String),

    /// The stream ended cleanly but no terminal event had been seen.
    #[error("push stream ended before a terminal event")]
    EndedEarly,
}

/// Stream of decoded SSE frames. Ends when the connection closes.
pub type FrameStream = BoxStream<'static, Result<RawFrame, TransportError>>;

/// Opens push streams for job sessions.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Opens the stream for `session_id`.
    ///
    /// Returning `Ok` means the connection is open; frames follow on the
    /// returned stream.
    async fn connect(&self, session_id: &str) -> Result<FrameStream, TransportError>;
}

/// SSE transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: Client,
    base_url: String,
    endpoint_template: String,
}

impl HttpPushTransport {
    /// Creates a transport for `endpoint_template`, resolved against `base_url`
    /// unless it is already absolute.
    ///
    /// Only the connection phase is bounded by `connect_timeout`; an open
    /// stream may stay idle indefinitely and is supervised by the monitor.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        endpoint_template: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            endpoint_template: endpoint_template.into(),
        })
    }

    /// Creates a transport for the stream endpoint returned at submission.
    ///
    /// # Errors
    ///
    /// See [`HttpPushTransport::new`].
    pub fn from_handle(
        base_url: impl Into<String>,
        handle: &JobHandle,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        Self::new(base_url, handle.stream_endpoint.clone(), connect_timeout)
    }

    /// Returns the stream URL for `session_id`.
    #[must_use]
    pub fn stream_url(&self, session_id: &str) -> String {
        let endpoint = fill_session_id(&self.endpoint_template, session_id);
        resolve_url(&self.base_url, &endpoint)
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn connect(&self, session_id: &str) -> Result<FrameStream, TransportError> {
        let url = self.stream_url(session_id);
        debug!(url = %url, "Opening push stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(frames_from_bytes(response.bytes_stream()))
    }
}

/// Substitutes the percent-encoded `session_id` into `template`.
#[must_use]
pub fn fill_session_id(template: &str, session_id: &str) -> String {
    template.replace(SESSION_ID_PLACEHOLDER, &urlencoding::encode(session_id))
}

/// Joins `path` onto `base_url`, leaving absolute URLs untouched.
#[must_use]
pub fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<RawFrame>,
    finished: bool,
}

/// Adapts a byte stream into a stream of SSE frames.
///
/// A read error is yielded once and ends the stream.
pub fn frames_from_bytes<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(chunk.as_ref());
                    state.ready.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(TransportError::Read(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    let trailing = state.decoder.finish();
                    state.ready.extend(trailing);
                }
            }
        }
    })
    .boxed()
}
