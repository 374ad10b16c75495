// SPDX-License-Identifier: MPL-2.0

//! Messages delivered by the transport

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::Serialize;

/// Delivery guarantee attached to a message by the broker, passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A received PUBLISH. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    dup: bool,
}

impl ReceivedMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            dup: false,
        }
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Raw payload bytes as received.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn dup(&self) -> bool {
        self.dup
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
