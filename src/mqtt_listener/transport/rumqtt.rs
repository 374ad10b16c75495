// SPDX-License-Identifier: MPL-2.0

//! [`MqttTransport`] backed by rumqttc
//!
//! Each started transport owns a small tokio runtime. The rumqttc event loop
//! is polled by a task on that runtime and translated into
//! [`TransportEventHandler`] callbacks. Blocking calls from the owner go
//! through `block_on`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{Outgoing, TlsConfiguration, Transport};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    tls, ConnectedInfo, DisconnectInfo, DisconnectReason, MqttTransport, TransportError,
    TransportEventHandler,
};
use crate::mqtt_listener::message::{QoS, ReceivedMessage};
use crate::mqtt_listener::opts::{Endpoint, ListenerOptions, ProtocolVersion};

const REQUEST_CAPACITY: usize = 64;
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

type AckResult = Result<(), String>;
type AckWaiter = oneshot::Sender<AckResult>;
type AckQueue = Arc<Mutex<PendingAcks>>;

/// SUBACK waiters
///
/// A waiter is queued when its request is handed to rumqttc and bound to a
/// packet id once the SUBSCRIBE goes out. SUBACKs are matched by that id, so a
/// waiter that gave up never receives another request's acknowledgment.
#[derive(Debug, Default)]
struct PendingAcks {
    queued: VecDeque<AckWaiter>,
    in_flight: HashMap<u16, AckWaiter>,
}

impl PendingAcks {
    fn sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn acknowledged(&mut self, pkid: u16, result: AckResult) {
        match self.in_flight.remove(&pkid) {
            Some(waiter) => {
                if waiter.send(result).is_err() {
                    debug!(pkid, "SUBACK arrived after its subscriber stopped waiting");
                }
            }
            None => debug!(pkid, "SUBACK without a waiter"),
        }
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Client {
    V4(rumqttc::AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

struct Session {
    runtime: Runtime,
    client: Client,
    worker: JoinHandle<()>,
}

/// rumqttc transport, single connection attempt, no reconnect
pub struct RumqttTransport {
    session: Option<Session>,
    connected: Arc<AtomicBool>,
    pending_acks: AckQueue,
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self {
            session: None,
            connected: Arc::new(AtomicBool::new(false)),
            pending_acks: AckQueue::default(),
        }
    }

    fn session(&self) -> Result<&Session, TransportError> {
        self.session.as_ref().ok_or(TransportError::NotStarted)
    }
}

impl MqttTransport for RumqttTransport {
    fn start(
        &mut self,
        options: ListenerOptions,
        handler: Box<dyn TransportEventHandler>,
    ) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Err(TransportError::Request("transport already started".to_string()));
        }

        let transport = wire_transport(&options)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mqtt-transport")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Runtime(e.to_string()))?;

        let mut worker = EventWorker {
            handler,
            connected: Arc::clone(&self.connected),
            pending_acks: Arc::clone(&self.pending_acks),
        };
        self.connected.store(false, Ordering::SeqCst);

        let (client, task) = match options.protocol_version {
            ProtocolVersion::V311 => {
                let (client, mut eventloop) =
                    rumqttc::AsyncClient::new(v4_options(&options, transport)?, REQUEST_CAPACITY);
                let task = runtime.spawn(async move {
                    loop {
                        let event = match eventloop.poll().await {
                            Ok(event) => translate_v4(event),
                            Err(e) => WireEvent::Failed(e.to_string()),
                        };
                        if !worker.dispatch(event) {
                            break;
                        }
                    }
                    worker.finish();
                });
                (Client::V4(client), task)
            }
            ProtocolVersion::V5 => {
                let (client, mut eventloop) = rumqttc::v5::AsyncClient::new(
                    v5_options(&options, transport)?,
                    REQUEST_CAPACITY,
                );
                let task = runtime.spawn(async move {
                    loop {
                        let event = match eventloop.poll().await {
                            Ok(event) => translate_v5(event),
                            Err(e) => WireEvent::Failed(e.to_string()),
                        };
                        if !worker.dispatch(event) {
                            break;
                        }
                    }
                    worker.finish();
                });
                (Client::V5(client), task)
            }
        };

        debug!(client_id = %options.client_id, "Event loop started");
        self.session = Some(Session {
            runtime,
            client,
            worker: task,
        });
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, timeout: Duration) -> Result<(), TransportError> {
        let session = self.session()?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_acks).queued.push_back(tx);

        let requested = session.runtime.block_on(async {
            match &session.client {
                Client::V4(client) => client
                    .subscribe(filter, rumqttc::QoS::AtMostOnce)
                    .await
                    .map_err(|e| e.to_string()),
                Client::V5(client) => client
                    .subscribe(filter, rumqttc::v5::mqttbytes::QoS::AtMostOnce)
                    .await
                    .map_err(|e| e.to_string()),
            }
        });
        if let Err(e) = requested {
            lock(&self.pending_acks).queued.pop_back();
            return Err(TransportError::Request(e));
        }

        match session
            .runtime
            .block_on(async { tokio::time::timeout(timeout, rx).await })
        {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::SubscribeRejected {
                topic: filter.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(TransportError::ChannelClosed("suback".to_string())),
            Err(_) => Err(TransportError::AckTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        let session = self.session()?;
        session
            .runtime
            .block_on(async {
                match &session.client {
                    Client::V4(client) => client.disconnect().await.map_err(|e| e.to_string()),
                    Client::V5(client) => client.disconnect().await.map_err(|e| e.to_string()),
                }
            })
            .map_err(TransportError::Request)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn release(&mut self) -> Result<(), TransportError> {
        let Some(Session {
            runtime,
            client,
            worker,
        }) = self.session.take()
        else {
            return Ok(());
        };

        drop(client);
        worker.abort();
        let joined =
            runtime.block_on(async { tokio::time::timeout(RELEASE_TIMEOUT, worker).await });
        runtime.shutdown_timeout(RELEASE_TIMEOUT);

        self.connected.store(false, Ordering::SeqCst);
        lock(&self.pending_acks).clear();

        match joined {
            Ok(Err(e)) if e.is_panic() => {
                Err(TransportError::Worker("event loop task panicked".to_string()))
            }
            Ok(_) => Ok(()),
            Err(_) => Err(TransportError::Worker(format!(
                "event loop did not stop within {} ms",
                RELEASE_TIMEOUT.as_millis()
            ))),
        }
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release MQTT transport");
        }
    }
}

/// Event loop output reduced to what the handler cares about
#[derive(Debug)]
enum WireEvent {
    Connected(ConnectedInfo),
    Message(ReceivedMessage),
    /// A SUBSCRIBE left with this packet id.
    SubscribeSent(u16),
    /// `Err` carries the first rejected reason code.
    SubAck { pkid: u16, result: AckResult },
    ServerDisconnect(Option<String>),
    ClientDisconnect,
    Failed(String),
    Ignored,
}

struct EventWorker {
    handler: Box<dyn TransportEventHandler>,
    connected: Arc<AtomicBool>,
    pending_acks: AckQueue,
}

impl EventWorker {
    /// Returns false once the connection is over.
    fn dispatch(&mut self, event: WireEvent) -> bool {
        match event {
            WireEvent::Connected(info) => {
                self.connected.store(true, Ordering::SeqCst);
                self.handler.on_connected(&info);
                true
            }
            WireEvent::Message(message) => {
                trace!(topic = message.topic(), "PUBLISH received");
                self.handler.on_message_received(message);
                true
            }
            WireEvent::SubscribeSent(pkid) => {
                lock(&self.pending_acks).sent(pkid);
                true
            }
            WireEvent::SubAck { pkid, result } => {
                lock(&self.pending_acks).acknowledged(pkid, result);
                true
            }
            WireEvent::ServerDisconnect(cause) => {
                self.connected.store(false, Ordering::SeqCst);
                let info = match cause {
                    Some(cause) => {
                        DisconnectInfo::with_cause(DisconnectReason::ServerDisconnected, cause)
                    }
                    None => DisconnectInfo::new(DisconnectReason::ServerDisconnected),
                };
                self.handler.on_disconnected(&info);
                false
            }
            WireEvent::ClientDisconnect => {
                self.connected.store(false, Ordering::SeqCst);
                self.handler
                    .on_disconnected(&DisconnectInfo::new(DisconnectReason::ClientRequested));
                false
            }
            WireEvent::Failed(cause) => {
                let reason = if self.connected.swap(false, Ordering::SeqCst) {
                    DisconnectReason::ConnectionLost
                } else {
                    DisconnectReason::ConnectFailed
                };
                self.handler
                    .on_disconnected(&DisconnectInfo::with_cause(reason, cause));
                false
            }
            WireEvent::Ignored => true,
        }
    }

    /// Waiters left behind see a closed channel.
    fn finish(self) {
        lock(&self.pending_acks).clear();
        debug!("Event loop finished");
    }
}

fn qos_from_v4(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn qos_from_v5(qos: rumqttc::v5::mqttbytes::QoS) -> QoS {
    match qos {
        rumqttc::v5::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::v5::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::v5::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn first_rejection<I>(codes: I) -> AckResult
where
    I: IntoIterator<Item = Option<String>>,
{
    match codes.into_iter().flatten().next() {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

fn translate_v4(event: rumqttc::Event) -> WireEvent {
    use rumqttc::{Event, Packet, SubscribeReasonCode};

    match event {
        Event::Incoming(Packet::ConnAck(ack)) => WireEvent::Connected(ConnectedInfo {
            session_present: ack.session_present,
        }),
        Event::Incoming(Packet::Publish(publish)) => WireEvent::Message(
            ReceivedMessage::new(
                publish.topic,
                publish.payload,
                qos_from_v4(publish.qos),
                publish.retain,
            )
            .with_dup(publish.dup),
        ),
        Event::Incoming(Packet::SubAck(ack)) => WireEvent::SubAck {
            pkid: ack.pkid,
            result: first_rejection(ack.return_codes.iter().map(|code| match code {
                SubscribeReasonCode::Success(_) => None,
                other => Some(format!("{:?}", other)),
            })),
        },
        Event::Incoming(Packet::Disconnect) => WireEvent::ServerDisconnect(None),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => WireEvent::SubscribeSent(pkid),
        Event::Outgoing(Outgoing::Disconnect) => WireEvent::ClientDisconnect,
        _ => WireEvent::Ignored,
    }
}

fn translate_v5(event: rumqttc::v5::Event) -> WireEvent {
    use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
    use rumqttc::v5::Event;

    match event {
        Event::Incoming(Packet::ConnAck(ack)) => WireEvent::Connected(ConnectedInfo {
            session_present: ack.session_present,
        }),
        Event::Incoming(Packet::Publish(publish)) => WireEvent::Message(
            ReceivedMessage::new(
                String::from_utf8_lossy(&publish.topic).into_owned(),
                publish.payload,
                qos_from_v5(publish.qos),
                publish.retain,
            )
            .with_dup(publish.dup),
        ),
        Event::Incoming(Packet::SubAck(ack)) => WireEvent::SubAck {
            pkid: ack.pkid,
            result: first_rejection(ack.return_codes.iter().map(|code| match code {
                SubscribeReasonCode::Success(_) => None,
                other => Some(format!("{:?}", other)),
            })),
        },
        Event::Incoming(Packet::Disconnect(disconnect)) => {
            WireEvent::ServerDisconnect(Some(format!("{:?}", disconnect.reason_code)))
        }
        Event::Outgoing(Outgoing::Subscribe(pkid)) => WireEvent::SubscribeSent(pkid),
        Event::Outgoing(Outgoing::Disconnect) => WireEvent::ClientDisconnect,
        _ => WireEvent::Ignored,
    }
}

/// Socket layer for the endpoint, with TLS when the policy asks for it.
fn wire_transport(options: &ListenerOptions) -> Result<Transport, TransportError> {
    let tls = if options.tls.use_tls {
        Some(TlsConfiguration::Rustls(tls::client_config(&options.tls)?))
    } else {
        None
    };

    match (&options.endpoint, tls) {
        (Endpoint::Tcp { .. }, None) => Ok(Transport::Tcp),
        (Endpoint::Tcp { .. }, Some(config)) => Ok(Transport::Tls(config)),
        #[cfg(feature = "websocket")]
        (Endpoint::WebSocket { .. }, None) => Ok(Transport::Ws),
        #[cfg(feature = "websocket")]
        (Endpoint::WebSocket { .. }, Some(config)) => Ok(Transport::Wss(config)),
        #[cfg(not(feature = "websocket"))]
        (Endpoint::WebSocket { .. }, _) => Err(TransportError::NotSupported(
            "built without the websocket feature".to_string(),
        )),
    }
}

/// Host and port handed to rumqttc. WebSocket endpoints pass the whole URI.
fn broker_address(endpoint: &Endpoint) -> Result<(String, u16), TransportError> {
    match endpoint {
        Endpoint::Tcp { host, port } => Ok((host.clone(), *port)),
        Endpoint::WebSocket { uri, .. } => {
            let port = websocket::port_of(uri)?;
            Ok((uri.clone(), port))
        }
    }
}

fn v4_options(
    options: &ListenerOptions,
    transport: Transport,
) -> Result<rumqttc::MqttOptions, TransportError> {
    let (host, port) = broker_address(&options.endpoint)?;
    let mut mqtt = rumqttc::MqttOptions::new(options.client_id.clone(), host, port);
    mqtt.set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session)
        .set_transport(transport);
    if let Some(credentials) = &options.credentials {
        mqtt.set_credentials(credentials.username.clone(), credentials.password.clone());
    }
    #[cfg(feature = "websocket")]
    if let Endpoint::WebSocket { headers, .. } = &options.endpoint {
        if !headers.is_empty() {
            let headers = websocket::parse_headers(headers)?;
            mqtt.set_request_modifier(move |request| {
                websocket::apply_headers(request, Arc::clone(&headers))
            });
        }
    }
    Ok(mqtt)
}

fn v5_options(
    options: &ListenerOptions,
    transport: Transport,
) -> Result<rumqttc::v5::MqttOptions, TransportError> {
    let (host, port) = broker_address(&options.endpoint)?;
    let mut mqtt = rumqttc::v5::MqttOptions::new(options.client_id.clone(), host, port);
    mqtt.set_keep_alive(options.keep_alive)
        .set_clean_start(options.clean_session)
        .set_transport(transport);
    if let Some(credentials) = &options.credentials {
        mqtt.set_credentials(credentials.username.clone(), credentials.password.clone());
    }
    #[cfg(feature = "websocket")]
    if let Endpoint::WebSocket { headers, .. } = &options.endpoint {
        if !headers.is_empty() {
            let headers = websocket::parse_headers(headers)?;
            mqtt.set_request_modifier(move |request| {
                websocket::apply_headers(request, Arc::clone(&headers))
            });
        }
    }
    Ok(mqtt)
}

#[cfg(feature = "websocket")]
mod websocket {
    use std::sync::Arc;

    use http::header::{HeaderName, HeaderValue};
    use http::{Request, Uri};

    use super::TransportError;

    pub(super) type Headers = Arc<Vec<(HeaderName, HeaderValue)>>;

    pub(super) fn port_of(uri: &str) -> Result<u16, TransportError> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", uri, e)))?;
        if parsed.host().is_none() {
            return Err(TransportError::InvalidAddress(format!("{}: missing host", uri)));
        }
        match (parsed.port_u16(), parsed.scheme_str()) {
            (Some(port), _) => Ok(port),
            (None, Some("wss")) => Ok(443),
            (None, Some("ws")) => Ok(80),
            (None, _) => Err(TransportError::InvalidAddress(format!(
                "{}: expected ws:// or wss://",
                uri
            ))),
        }
    }

    pub(super) fn parse_headers(headers: &[(String, String)]) -> Result<Headers, TransportError> {
        headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::try_from(name.as_str())
                    .map_err(|e| TransportError::InvalidHeader(format!("{}: {}", name, e)))?;
                let value = HeaderValue::try_from(value.as_str())
                    .map_err(|e| TransportError::InvalidHeader(format!("{}: {}", name, e)))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Arc::new)
    }

    pub(super) async fn apply_headers(mut request: Request<()>, headers: Headers) -> Request<()> {
        for (name, value) in headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        request
    }
}

#[cfg(not(feature = "websocket"))]
mod websocket {
    use super::TransportError;

    pub(super) fn port_of(_uri: &str) -> Result<u16, TransportError> {
        Err(TransportError::NotSupported(
            "built without the websocket feature".to_string(),
        ))
    }
}
