// SPDX-License-Identifier: MPL-2.0

//! Output records for emitted messages
//!
//! The shape is picked once per invocation: either the payload text alone, or
//! the complete message with topic and flags.

use std::io::{self, Write};

use bytes::Bytes;
use serde::Serialize;

use super::message::{QoS, ReceivedMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Full,
    PayloadOnly,
}

impl OutputMode {
    pub fn from_only_payload(only_payload: bool) -> Self {
        if only_payload {
            Self::PayloadOnly
        } else {
            Self::Full
        }
    }

    pub fn render(self, message: ReceivedMessage) -> OutputRecord {
        match self {
            Self::PayloadOnly => OutputRecord::Payload(message.payload_str().into_owned()),
            Self::Full => OutputRecord::Message(MessageRecord::from(message)),
        }
    }
}

/// A received message with every field carried over unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl From<ReceivedMessage> for MessageRecord {
    fn from(message: ReceivedMessage) -> Self {
        Self {
            topic: message.topic().to_string(),
            payload: message.payload().clone(),
            qos: message.qos(),
            retain: message.retain(),
            dup: message.dup(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRecord {
    Payload(String),
    Message(MessageRecord),
}

#[derive(Serialize)]
struct JsonLine<'a> {
    topic: &'a str,
    /// Payload text, or null when it is not valid UTF-8.
    payload: Option<&'a str>,
    payload_hex: String,
    qos: u8,
    retain: bool,
    dup: bool,
}

impl<'a> From<&'a MessageRecord> for JsonLine<'a> {
    fn from(record: &'a MessageRecord) -> Self {
        Self {
            topic: &record.topic,
            payload: std::str::from_utf8(&record.payload).ok(),
            payload_hex: hex::encode(&record.payload),
            qos: record.qos.as_u8(),
            retain: record.retain,
            dup: record.dup,
        }
    }
}

/// Writes one record per line and flushes after each.
pub struct RecordWriter<W: Write> {
    out: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write(&mut self, record: &OutputRecord) -> io::Result<()> {
        match record {
            OutputRecord::Payload(text) => writeln!(self.out, "{}", text)?,
            OutputRecord::Message(message) => {
                serde_json::to_writer(&mut self.out, &JsonLine::from(message))?;
                self.out.write_all(b"\n")?;
            }
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
