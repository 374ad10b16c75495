// SPDX-License-Identifier: MPL-2.0

//! Error types for listener operations
//!
//! Every failure the bridge can surface is a [`ListenerError`]. None of them
//! are retried internally. `Cancelled` is the normal way the consumption loop
//! ends and is not an application failure.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};

use super::transport::TransportError;

/// Error type for connect, subscribe, consume and stop operations
#[derive(Debug, Clone, serde::Serialize)]
pub enum ListenerError {
    // ==================== Connect ====================
    /// No connected confirmation within the connect timeout
    ConnectTimeout {
        client_id: String,
        timeout_ms: u64,
        at: SystemTime,
    },

    /// The transport failed while setting up the connection
    ConnectError {
        client_id: String,
        cause: TransportError,
        at: SystemTime,
    },

    // ==================== Subscribe ====================
    /// The transport raised or the broker rejected a topic filter
    SubscribeError {
        topic: String,
        cause: TransportError,
        at: SystemTime,
    },

    // ==================== Disconnect ====================
    /// No disconnected confirmation within the disconnect timeout
    DisconnectTimeout {
        client_id: String,
        timeout_ms: u64,
        at: SystemTime,
    },

    /// The transport failed while stopping or being released
    ///
    /// When release fails after an earlier teardown failure, the earlier one
    /// is kept in `superseded`.
    DisconnectError {
        client_id: String,
        cause: TransportError,
        superseded: Option<Box<ListenerError>>,
        at: SystemTime,
    },

    // ==================== Consumption ====================
    /// External cancellation observed by the consumption loop
    Cancelled,

    /// The output sink refused a record
    OutputError { message: String },

    // ==================== Configuration ====================
    /// Invalid listener options
    InvalidConfiguration { field: String, reason: String },
}

impl ListenerError {
    pub fn connect_timeout(client_id: &str, timeout: Duration) -> Self {
        Self::ConnectTimeout {
            client_id: client_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
            at: SystemTime::now(),
        }
    }

    pub fn connect_error(client_id: &str, cause: TransportError) -> Self {
        Self::ConnectError {
            client_id: client_id.to_string(),
            cause,
            at: SystemTime::now(),
        }
    }

    pub fn subscribe_error(topic: &str, cause: TransportError) -> Self {
        Self::SubscribeError {
            topic: topic.to_string(),
            cause,
            at: SystemTime::now(),
        }
    }

    pub fn disconnect_timeout(client_id: &str, timeout: Duration) -> Self {
        Self::DisconnectTimeout {
            client_id: client_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
            at: SystemTime::now(),
        }
    }

    pub fn disconnect_error(client_id: &str, cause: TransportError) -> Self {
        Self::DisconnectError {
            client_id: client_id.to_string(),
            cause,
            superseded: None,
            at: SystemTime::now(),
        }
    }

    pub fn invalid_configuration(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach an earlier failure that this one replaces.
    ///
    /// Only `DisconnectError` carries a superseded error; other variants are
    /// returned unchanged.
    pub fn superseding(self, earlier: ListenerError) -> Self {
        match self {
            Self::DisconnectError {
                client_id,
                cause,
                at,
                ..
            } => Self::DisconnectError {
                client_id,
                cause,
                superseded: Some(Box::new(earlier)),
                at,
            },
            other => other,
        }
    }

    /// Returns true for the normal termination of the consumption loop
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the error is a bounded wait that ran out
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::DisconnectTimeout { .. }
        )
    }

    /// The transport failure behind this error, if any
    pub fn transport_cause(&self) -> Option<&TransportError> {
        match self {
            Self::ConnectError { cause, .. }
            | Self::SubscribeError { cause, .. }
            | Self::DisconnectError { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// When the failure was detected, for connection-related errors
    pub fn occurred_at(&self) -> Option<SystemTime> {
        match self {
            Self::ConnectTimeout { at, .. }
            | Self::ConnectError { at, .. }
            | Self::SubscribeError { at, .. }
            | Self::DisconnectTimeout { at, .. }
            | Self::DisconnectError { at, .. } => Some(*at),
            _ => None,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectTimeout {
                client_id,
                timeout_ms,
                ..
            } => {
                format!(
                    "Failed to connect client '{}': no confirmation within {} ms",
                    client_id, timeout_ms
                )
            }
            Self::ConnectError {
                client_id, cause, ..
            } => {
                format!("Failed to start client '{}': {}", client_id, cause)
            }
            Self::SubscribeError { topic, cause, .. } => {
                format!("Failed to subscribe to topic '{}': {}", topic, cause)
            }
            Self::DisconnectTimeout {
                client_id,
                timeout_ms,
                ..
            } => {
                format!(
                    "Failed to receive disconnect confirmation for client '{}' within {} ms",
                    client_id, timeout_ms
                )
            }
            Self::DisconnectError {
                client_id,
                cause,
                superseded,
                ..
            } => {
                let earlier = superseded
                    .as_ref()
                    .map(|e| format!(" (after: {})", e.user_message()))
                    .unwrap_or_default();
                format!(
                    "Failed to stop client '{}': {}{}",
                    client_id, cause, earlier
                )
            }
            Self::Cancelled => "Pipeline stop requested".to_string(),
            Self::OutputError { message } => format!("Failed to write output: {}", message),
            Self::InvalidConfiguration { field, reason } => {
                format!("Invalid configuration for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DisconnectError {
                superseded: Some(earlier),
                ..
            } => Some(earlier.as_ref()),
            _ => self
                .transport_cause()
                .map(|cause| cause as &(dyn std::error::Error + 'static)),
        }
    }
}

impl From<io::Error> for ListenerError {
    fn from(error: io::Error) -> Self {
        Self::OutputError {
            message: error.to_string(),
        }
    }
}

/// Type alias for Result with ListenerError
pub type ListenerResult<T> = Result<T, ListenerError>;
