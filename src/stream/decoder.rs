//! Decoder for the newline-delimited `data: {...}` records a chat backend streams back.
//!
//! Bytes arrive in arbitrary pieces: a record may span several chunks and a chunk may
//! carry several records, possibly cutting a UTF-8 character in half. [`StreamDecoder`]
//! keeps whatever is incomplete and only ever parses whole records.

use crate::conversation::Role;
use serde::Deserialize;

const FRAMING_MARKER: &str = "data:";
const SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A new message from `Role` starts here.
    RoleAnnounce(Role),
    /// Text to append to the message currently being streamed.
    ContentDelta(String),
    StreamEnd,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed record {record:?}: {source}")]
    Json {
        record: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One decoded line of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Blank lines and SSE comments.
    Empty,
    Sentinel,
    Delta {
        role: Option<Role>,
        content: Option<String>,
    },
}

impl Record {
    fn push_events(self, out: &mut Vec<ProtocolEvent>) {
        match self {
            Record::Empty => {}
            Record::Sentinel => out.push(ProtocolEvent::StreamEnd),
            Record::Delta { role, content } => {
                if let Some(role) = role {
                    out.push(ProtocolEvent::RoleAnnounce(role));
                }
                if let Some(text) = content.filter(|t| !t.is_empty()) {
                    out.push(ProtocolEvent::ContentDelta(text));
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
}

/// Parse a single complete line (without its `\n`).
pub fn parse_record(line: &str) -> Result<Record, DecodeError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.starts_with(':') {
        return Ok(Record::Empty);
    }

    let data = match line.strip_prefix(FRAMING_MARKER) {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(Record::Empty);
    }
    if data == SENTINEL {
        return Ok(Record::Sentinel);
    }

    let payload: Payload = serde_json::from_str(data).map_err(|source| DecodeError::Json {
        record: data.to_string(),
        source,
    })?;

    // Only the first choice is rendered.
    let delta = payload
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.delta);

    Ok(match delta {
        Some(d) => Record::Delta {
            role: d.role,
            content: d.content,
        },
        None => Record::Delta {
            role: None,
            content: None,
        },
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// JSON payload records decoded successfully.
    pub payloads: usize,
    /// Records skipped because they failed to parse.
    pub malformed: usize,
}

/// Incremental decoder for one streamed response.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Leading bytes of a UTF-8 character whose remaining bytes have not arrived yet.
    partial_char: Vec<u8>,
    /// Text after the last newline seen so far.
    tail: String,
    finished: bool,
    stats: DecodeStats,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel was seen or [`finish`](Self::finish) was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode one transport chunk into the events of every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let text = self.decode_utf8(chunk);
        // The buffered tail never holds a newline, so only the new text needs scanning.
        let appended_at = self.tail.len();
        self.tail.push_str(&text);

        let Some(last_newline) = self.tail[appended_at..].rfind('\n').map(|i| appended_at + i)
        else {
            return events;
        };
        let rest = self.tail.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.tail, rest);

        for line in complete.split('\n') {
            if self.process_line(line, &mut events) {
                break;
            }
        }
        events
    }

    /// Called when the transport reports end of stream. The unterminated tail, if any,
    /// is decoded as a final record.
    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        if !self.partial_char.is_empty() {
            let bytes = std::mem::take(&mut self.partial_char);
            self.tail.push_str(&String::from_utf8_lossy(&bytes));
        }
        let tail = std::mem::take(&mut self.tail);
        self.process_line(&tail, &mut events);
        self.finished = true;
        events
    }

    /// Returns true when the sentinel ends the stream.
    fn process_line(&mut self, line: &str, events: &mut Vec<ProtocolEvent>) -> bool {
        match parse_record(line) {
            Ok(Record::Sentinel) => {
                Record::Sentinel.push_events(events);
                self.finished = true;
                self.tail.clear();
                self.partial_char.clear();
                true
            }
            Ok(Record::Empty) => false,
            Ok(record) => {
                self.stats.payloads += 1;
                record.push_events(events);
                false
            }
            Err(err) => {
                self.stats.malformed += 1;
                tracing::warn!(error = %err, "skipping stream record");
                false
            }
        }
    }

    /// Invalid sequences become U+FFFD; an incomplete sequence at the end of the
    /// chunk is held back until the next one.
    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.partial_char.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.partial_char.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.partial_char[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.partial_char.len();
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.partial_char[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.partial_char.drain(..start);
        out
    }
}
