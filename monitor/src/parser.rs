//! Push event parser.
//!
//! Turns one raw push message into an [`EventEnvelope`]. The backend is not
//! consistent about framing: some events arrive as a bare JSON document, some
//! carry a literal `data:` line inside the payload, and a few are wrapped
//! twice (a JSON string whose contents are another `data:` line). All three
//! shapes decode to the same envelope.
//!
//! The parser is pure; the monitor decides what to do with the result.

use serde_json::Value;
use thiserror::Error;

use crate::sse::RawFrame;
use crate::types::{EventEnvelope, EventType};

/// Prefix of a framed data line.
const DATA_PREFIX: &str = "data:";

/// Errors produced when a push message cannot be decoded.
///
/// These are always recovered: the monitor logs and drops the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEventError {
    /// The message body was empty or whitespace.
    #[error("empty event payload")]
    Empty,

    /// The message looked framed but had no `data:` line.
    #[error("framed event has no data line")]
    MissingDataLine,

    /// The payload was not valid JSON.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
}

/// Parses a raw push message.
///
/// `transport_type` is the event name supplied by the transport, if any. It
/// wins over the payload's own `type` field, which in turn wins over the
/// default of `message`.
///
/// # Errors
///
/// Returns [`MalformedEventError`] when the input is empty, framed without a
/// data line, or not JSON after unwrapping.
pub fn parse_event(
    raw: &str,
    transport_type: Option<&str>,
) -> Result<EventEnvelope, MalformedEventError> {
    let payload = decode_payload(raw)?;

    let event_type = transport_type
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .or_else(|| payload.get("type").and_then(Value::as_str))
        .map_or(EventType::Message, EventType::from_name);

    // Keep-alives sent on the default channel carry only a timestamp.
    let event_type = if event_type == EventType::Message && is_bare_timestamp(&payload) {
        EventType::Ping
    } else {
        event_type
    };

    let is_final_hint = payload.get("is_final").and_then(Value::as_bool) == Some(true)
        || payload.get("type").and_then(Value::as_str) == Some("final_result");

    Ok(EventEnvelope {
        event_type,
        payload,
        is_final_hint,
        id: None,
    })
}

/// Parses a frame produced by the SSE decoder, keeping its event id.
///
/// # Errors
///
/// See [`parse_event`].
pub fn parse_frame(frame: &RawFrame) -> Result<EventEnvelope, MalformedEventError> {
    let mut envelope = parse_event(&frame.data, frame.event.as_deref())?;
    envelope.id.clone_from(&frame.id);
    Ok(envelope)
}

fn decode_payload(raw: &str) -> Result<Value, MalformedEventError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MalformedEventError::Empty);
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(direct_err) => {
            if !trimmed.contains(DATA_PREFIX) {
                return Err(MalformedEventError::InvalidJson(direct_err.to_string()));
            }
            parse_data_line(trimmed)?
        }
    };

    // Double-wrapped: the JSON value is itself a string holding a data line.
    match value {
        Value::String(inner) if inner.trim_start().starts_with(DATA_PREFIX) => {
            parse_data_line(&inner)
        }
        other => Ok(other),
    }
}

fn parse_data_line(text: &str) -> Result<Value, MalformedEventError> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(DATA_PREFIX))
        .ok_or(MalformedEventError::MissingDataLine)?;

    let body = line[DATA_PREFIX.len()..].trim();
    if body.is_empty() {
        return Err(MalformedEventError::Empty);
    }

    serde_json::from_str(body).map_err(|e| MalformedEventError::InvalidJson(e.to_string()))
}

fn is_bare_timestamp(payload: &Value) -> bool {
    payload
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.contains_key("timestamp"))
}
