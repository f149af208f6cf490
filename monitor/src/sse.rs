//! Incremental Server-Sent Events decoder.
//!
//! Bytes arrive from the network in arbitrary chunks. [`SseDecoder`] buffers
//! partial lines and emits a [`RawFrame`] each time a blank line terminates an
//! event that carried at least one `data` field.

/// One dispatched SSE event, before JSON decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Value of the `event` field, if present.
    pub event: Option<String>,
    /// `data` field values joined with `\n`.
    pub data: String,
    /// Value of the `id` field, if present.
    pub id: Option<String>,
}

/// Line-buffered SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.line_buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline_index) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.line_buffer.drain(..=newline_index).collect::<Vec<_>>();
            line.pop();
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }

            if let Some(frame) = self.process_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing partial line and any pending event at end of stream.
    pub fn finish(&mut self) -> Option<RawFrame> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            return self.dispatch();
        }

        // Comment line, used by servers as a keep-alive.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry` and unknown fields are ignored.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }

        Some(RawFrame {
            event: event.filter(|name| !name.is_empty()),
            data: std::mem::take(&mut self.data).join("\n"),
            id,
        })
    }
}
