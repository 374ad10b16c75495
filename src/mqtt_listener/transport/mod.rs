// SPDX-License-Identifier: MPL-2.0

//! Transport abstraction for the listener
//!
//! The listener never speaks MQTT itself. It drives an [`MqttTransport`] that
//! owns the network connection and reports lifecycle events back through a
//! [`TransportEventHandler`] on the transport's own execution context.

use std::time::Duration;

use serde::Serialize;

use super::message::ReceivedMessage;
use super::opts::ListenerOptions;

pub mod rumqtt;
pub mod tls;

pub use rumqtt::RumqttTransport;

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request header: {0}")]
    InvalidHeader(String),

    #[error("Transport not supported: {0}")]
    NotSupported(String),

    #[error("Client request failed: {0}")]
    Request(String),

    #[error("Subscription to '{topic}' rejected by broker: {reason}")]
    SubscribeRejected { topic: String, reason: String },

    #[error("No acknowledgment within {timeout_ms} ms")]
    AckTimeout { timeout_ms: u64 },

    #[error("Transport has not been started")]
    NotStarted,

    #[error("Internal channel '{0}' closed unexpectedly")]
    ChannelClosed(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Event loop worker failed: {0}")]
    Worker(String),
}

/// Details of a CONNACK accepted by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectedInfo {
    pub session_present: bool,
}

/// Why the transport stopped talking to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The client sent DISCONNECT after `stop` was requested.
    ClientRequested,
    /// The broker sent DISCONNECT.
    ServerDisconnected,
    /// The connection failed before the broker accepted it.
    ConnectFailed,
    /// An established connection broke.
    ConnectionLost,
}

/// Disconnect event payload: a reason plus the underlying cause, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    pub cause: Option<String>,
}

impl DisconnectInfo {
    pub fn new(reason: DisconnectReason) -> Self {
        Self {
            reason,
            cause: None,
        }
    }

    pub fn with_cause(reason: DisconnectReason, cause: impl Into<String>) -> Self {
        Self {
            reason,
            cause: Some(cause.into()),
        }
    }

    pub fn describe(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{:?}: {}", self.reason, cause),
            None => format!("{:?}", self.reason),
        }
    }
}

/// Callbacks invoked by a transport on its own execution context
///
/// Implementations must not block; they run inside the transport's event loop.
pub trait TransportEventHandler: Send {
    /// Called when the broker accepted the connection
    fn on_connected(&mut self, info: &ConnectedInfo) {
        let _ = info;
    }

    /// Called once when the connection ends, for whatever reason
    fn on_disconnected(&mut self, info: &DisconnectInfo) {
        let _ = info;
    }

    /// Called for every incoming PUBLISH, in arrival order
    fn on_message_received(&mut self, message: ReceivedMessage) {
        let _ = message;
    }
}

/// The capability set the listener needs from an MQTT client
///
/// `start` and `stop` only *request* the transition; completion is reported
/// through the event handler. `subscribe` waits for the broker's answer.
/// `release` frees every resource the transport holds and must be safe to call
/// whether or not the transport ever connected.
pub trait MqttTransport: Send {
    /// Begin connecting with `options`, reporting events to `handler`.
    fn start(
        &mut self,
        options: ListenerOptions,
        handler: Box<dyn TransportEventHandler>,
    ) -> Result<(), TransportError>;

    /// Subscribe to `filter` at QoS 0 and wait up to `timeout` for the acknowledgment.
    fn subscribe(&mut self, filter: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Request an orderly disconnect.
    fn stop(&mut self) -> Result<(), TransportError>;

    /// Returns true while the broker connection is established.
    fn is_connected(&self) -> bool;

    /// Release the underlying client.
    fn release(&mut self) -> Result<(), TransportError>;
}

impl<T: MqttTransport + ?Sized> MqttTransport for Box<T> {
    fn start(
        &mut self,
        options: ListenerOptions,
        handler: Box<dyn TransportEventHandler>,
    ) -> Result<(), TransportError> {
        (**self).start(options, handler)
    }

    fn subscribe(&mut self, filter: &str, timeout: Duration) -> Result<(), TransportError> {
        (**self).subscribe(filter, timeout)
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        (**self).stop()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn release(&mut self) -> Result<(), TransportError> {
        (**self).release()
    }
}
