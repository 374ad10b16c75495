// SPDX-License-Identifier: MPL-2.0

//! Connection bridge
//!
//! [`Listener`] wraps a callback-driven [`MqttTransport`] and exposes blocking
//! start, subscribe and stop operations. Transport callbacks run on the
//! transport's own execution context and only touch the shared state through
//! [`ConfirmationSignal`]s and the inbox sender.

use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ListenerConfig;
use super::consumer::{self, MessageStream};
use super::error::{ListenerError, ListenerResult};
use super::inbox::{Inbox, InboxSender};
use super::message::ReceivedMessage;
use super::opts::ListenerOptions;
use super::signal::ConfirmationSignal;
use super::transport::{
    ConnectedInfo, DisconnectInfo, MqttTransport, RumqttTransport, TransportError,
    TransportEventHandler,
};

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the connected signal carries back to `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The broker accepted the connection.
    Accepted(ConnectedInfo),
    /// The transport gave up before the connection was accepted.
    Refused(DisconnectInfo),
}

#[derive(Debug)]
struct BridgeState {
    state: Mutex<ConnectionState>,
    connected: ConfirmationSignal<ConnectOutcome>,
    disconnected: ConfirmationSignal<DisconnectInfo>,
    last_disconnect: Mutex<Option<DisconnectInfo>>,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            connected: ConfirmationSignal::new(),
            disconnected: ConfirmationSignal::new(),
            last_disconnect: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Set the state, returning the previous one.
    fn transition(&self, next: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *lock(&self.state), next)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event handler installed on the transport by [`Listener::start_with`]
pub struct BridgeEventHandler {
    shared: Arc<BridgeState>,
    inbox: InboxSender,
}

impl TransportEventHandler for BridgeEventHandler {
    fn on_connected(&mut self, info: &ConnectedInfo) {
        self.shared.transition(ConnectionState::Connected);
        self.shared.disconnected.reset();
        self.shared
            .connected
            .set(ConnectOutcome::Accepted(info.clone()));
    }

    fn on_disconnected(&mut self, info: &DisconnectInfo) {
        *lock(&self.shared.last_disconnect) = Some(info.clone());

        let previous = self.shared.transition(ConnectionState::Disconnected);
        if previous == ConnectionState::Connecting {
            self.shared
                .connected
                .set(ConnectOutcome::Refused(info.clone()));
        } else if previous == ConnectionState::Connected {
            warn!(reason = ?info.reason, cause = ?info.cause, "Connection to broker ended");
        }
        self.shared.disconnected.set(info.clone());
    }

    fn on_message_received(&mut self, message: ReceivedMessage) {
        if !self.inbox.push(message) {
            debug!("Inbox closed, dropping message");
        }
    }
}

/// A connected MQTT listener
///
/// Created by [`Listener::start`], torn down by [`Listener::stop`] or on drop.
/// The transport is owned exclusively and released exactly once.
pub struct Listener<T: MqttTransport> {
    client_id: String,
    transport: Option<T>,
    shared: Arc<BridgeState>,
    inbox: Inbox,
    config: ListenerConfig,
}

impl Listener<RumqttTransport> {
    /// Connect with the default transport and the default timeouts.
    ///
    /// Blocks until the broker confirms the connection or 15 seconds pass.
    pub fn start(options: ListenerOptions) -> ListenerResult<Self> {
        Self::start_with(RumqttTransport::new(), options, ListenerConfig::default())
    }
}

impl<T: MqttTransport> Listener<T> {
    /// Connect through `transport`, waiting up to `config.connect_timeout`.
    ///
    /// A single attempt is made. On failure the transport is released before
    /// the error is returned.
    pub fn start_with(
        transport: T,
        options: ListenerOptions,
        config: ListenerConfig,
    ) -> ListenerResult<Self> {
        let (sender, inbox) = Inbox::channel();
        let shared = Arc::new(BridgeState::new());
        let mut listener = Listener {
            client_id: options.client_id.clone(),
            transport: Some(transport),
            shared,
            inbox,
            config,
        };

        listener.shared.connected.reset();
        listener.shared.disconnected.reset();
        listener.shared.transition(ConnectionState::Connecting);

        info!(
            client_id = %listener.client_id,
            endpoint = %options.endpoint,
            protocol = %options.protocol_version,
            "Connecting to broker"
        );

        let handler = BridgeEventHandler {
            shared: Arc::clone(&listener.shared),
            inbox: sender,
        };
        let started = match listener.transport.as_mut() {
            Some(transport) => transport.start(options, Box::new(handler)),
            None => Err(TransportError::NotStarted),
        };
        if let Err(cause) = started {
            listener.abandon();
            return Err(ListenerError::connect_error(&listener.client_id, cause));
        }

        let timeout = listener.config.connect_timeout;
        match listener.shared.connected.wait_timeout(timeout) {
            Some(ConnectOutcome::Accepted(info)) => {
                info!(
                    client_id = %listener.client_id,
                    session_present = info.session_present,
                    "Connected"
                );
                Ok(listener)
            }
            Some(ConnectOutcome::Refused(info)) => {
                listener.abandon();
                Err(ListenerError::connect_error(
                    &listener.client_id,
                    TransportError::ConnectionFailed(info.describe()),
                ))
            }
            None => {
                listener.abandon();
                Err(ListenerError::connect_timeout(&listener.client_id, timeout))
            }
        }
    }

    /// Subscribe to one topic filter at QoS 0.
    ///
    /// Blocks until the broker acknowledges. A failure leaves the connection
    /// usable.
    pub fn subscribe(&mut self, topic: &str) -> ListenerResult<()> {
        let timeout = self.config.subscribe_timeout;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ListenerError::subscribe_error(topic, TransportError::NotStarted))?;

        debug!(client_id = %self.client_id, topic, "Subscribing");
        transport.subscribe(topic, timeout).map_err(|cause| {
            warn!(client_id = %self.client_id, topic, error = %cause, "Subscribe failed");
            ListenerError::subscribe_error(topic, cause)
        })?;
        info!(client_id = %self.client_id, topic, "Subscribed");
        Ok(())
    }

    /// Subscribe to every filter in order, stopping at the first failure.
    pub fn subscribe_all<I, S>(&mut self, topics: I) -> ListenerResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            self.subscribe(topic.as_ref())?;
        }
        Ok(())
    }

    /// Messages received so far, in arrival order.
    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Pull-based view of the inbox that ends once `cancel` fires.
    pub fn messages(&self, cancel: &CancellationToken) -> MessageStream<'_> {
        MessageStream::new(&self.inbox, cancel.clone(), self.config.poll_interval)
    }

    /// Hand every message to `emit` until `cancel` fires.
    ///
    /// Only returns with an error; [`ListenerError::Cancelled`] is the
    /// normal way out.
    pub fn run<F>(&self, cancel: &CancellationToken, emit: F) -> ListenerResult<Infallible>
    where
        F: FnMut(ReceivedMessage) -> io::Result<()>,
    {
        consumer::run(&self.inbox, cancel, self.config.poll_interval, emit)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The most recent disconnect reported by the transport.
    pub fn last_disconnect(&self) -> Option<DisconnectInfo> {
        lock(&self.shared.last_disconnect).clone()
    }

    /// Disconnect and release the transport.
    ///
    /// The disconnect wait is skipped when the transport is no longer
    /// connected. The transport is released in every case.
    pub fn stop(mut self) -> ListenerResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> ListenerResult<()> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };

        let outcome = if transport.is_connected() {
            self.shared.transition(ConnectionState::Disconnecting);
            info!(client_id = %self.client_id, "Disconnecting");
            self.request_disconnect(&mut transport)
        } else {
            debug!(client_id = %self.client_id, "Transport not connected, skipping disconnect");
            Ok(())
        };

        let released = transport.release();
        self.shared.transition(ConnectionState::Disconnected);

        match (released, outcome) {
            (Ok(()), outcome) => {
                if outcome.is_ok() {
                    info!(client_id = %self.client_id, "Disconnected");
                }
                outcome
            }
            (Err(cause), Ok(())) => Err(ListenerError::disconnect_error(&self.client_id, cause)),
            (Err(cause), Err(earlier)) => {
                Err(ListenerError::disconnect_error(&self.client_id, cause).superseding(earlier))
            }
        }
    }

    fn request_disconnect(&self, transport: &mut T) -> ListenerResult<()> {
        transport
            .stop()
            .map_err(|cause| ListenerError::disconnect_error(&self.client_id, cause))?;

        let timeout = self.config.disconnect_timeout;
        match self.shared.disconnected.wait_timeout(timeout) {
            Some(info) => {
                debug!(client_id = %self.client_id, reason = ?info.reason, "Disconnect confirmed");
                Ok(())
            }
            None => Err(ListenerError::disconnect_timeout(&self.client_id, timeout)),
        }
    }

    /// Release the transport after a failed start.
    fn abandon(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.release() {
                warn!(client_id = %self.client_id, error = %e, "Failed to release transport");
            }
        }
        self.shared.transition(ConnectionState::Disconnected);
    }
}

impl<T: MqttTransport> Drop for Listener<T> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            if let Err(e) = self.teardown() {
                warn!(client_id = %self.client_id, error = %e, "Teardown on drop failed");
            }
        }
    }
}
