// SPDX-License-Identifier: MPL-2.0

pub mod config;
pub mod consumer;
pub mod error;
pub mod inbox;
pub mod listener;
pub mod message;
pub mod opts;
pub mod output;
pub mod signal;
pub mod transport;

pub use config::ListenerConfig;
pub use consumer::MessageStream;
pub use error::{ListenerError, ListenerResult};
pub use inbox::{Inbox, InboxSender};
pub use listener::{BridgeEventHandler, ConnectOutcome, ConnectionState, Listener};
pub use message::{QoS, ReceivedMessage};
pub use opts::{Credentials, Endpoint, ListenerOptions, ProtocolVersion, TlsTrustPolicy};
pub use output::{MessageRecord, OutputMode, OutputRecord, RecordWriter};
pub use transport::{
    ConnectedInfo, DisconnectInfo, DisconnectReason, MqttTransport, RumqttTransport,
    TransportError, TransportEventHandler,
};
