//! Connection Bridge Integration Tests
//!
//! Drives `Listener` through a scripted transport to verify:
//! - Connect confirmation, refusal and timeout
//! - Ordered, fail-fast subscription
//! - Teardown with and without a disconnect wait, release exactly once
//! - Message delivery from the transport context to the consumer

use mqtt_listener::mqtt_listener::{
    ConnectedInfo, ConnectionState, DisconnectInfo, DisconnectReason, Listener, ListenerConfig,
    ListenerError, ListenerOptions, MqttTransport, OutputMode, OutputRecord, QoS,
    ReceivedMessage, TransportError, TransportEventHandler,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, PartialEq)]
enum ConnectScript {
    Accept,
    Refuse,
    Silent,
    FailStart,
}

#[derive(Clone, Copy, PartialEq)]
enum DisconnectScript {
    /// Confirm from within `stop`
    Immediate,
    /// Confirm from another thread after the delay
    After(Duration),
    Never,
}

/// What the transport saw, shared with the test body
#[derive(Default)]
struct Observed {
    connected: bool,
    stops: u32,
    releases: u32,
    subscribed: Vec<String>,
    handler: Option<Box<dyn TransportEventHandler>>,
}

type SharedObserved = Arc<Mutex<Observed>>;

struct ScriptedTransport {
    script: ConnectScript,
    reject_topic: Option<String>,
    disconnect: DisconnectScript,
    fail_release: bool,
    observed: SharedObserved,
}

impl ScriptedTransport {
    fn new(script: ConnectScript) -> (Self, SharedObserved) {
        let observed = SharedObserved::default();
        let transport = Self {
            script,
            reject_topic: None,
            disconnect: DisconnectScript::Immediate,
            fail_release: false,
            observed: Arc::clone(&observed),
        };
        (transport, observed)
    }
}

impl MqttTransport for ScriptedTransport {
    fn start(
        &mut self,
        _options: ListenerOptions,
        mut handler: Box<dyn TransportEventHandler>,
    ) -> Result<(), TransportError> {
        let mut observed = self.observed.lock().unwrap();
        match self.script {
            ConnectScript::FailStart => {
                return Err(TransportError::ConnectionFailed("socket error".to_string()))
            }
            ConnectScript::Accept => {
                observed.connected = true;
                handler.on_connected(&ConnectedInfo::default());
            }
            ConnectScript::Refuse => {
                handler.on_disconnected(&DisconnectInfo::with_cause(
                    DisconnectReason::ConnectFailed,
                    "not authorized",
                ));
            }
            ConnectScript::Silent => {}
        }
        observed.handler = Some(handler);
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, _timeout: Duration) -> Result<(), TransportError> {
        self.observed.lock().unwrap().subscribed.push(filter.to_string());
        if self.reject_topic.as_deref() == Some(filter) {
            return Err(TransportError::SubscribeRejected {
                topic: filter.to_string(),
                reason: "NotAuthorized".to_string(),
            });
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        let mut observed = self.observed.lock().unwrap();
        observed.stops += 1;
        match self.disconnect {
            DisconnectScript::Immediate => confirm_disconnect(&mut observed),
            DisconnectScript::After(delay) => {
                let shared = Arc::clone(&self.observed);
                thread::spawn(move || {
                    thread::sleep(delay);
                    confirm_disconnect(&mut shared.lock().unwrap());
                });
            }
            DisconnectScript::Never => {}
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.observed.lock().unwrap().connected
    }

    fn release(&mut self) -> Result<(), TransportError> {
        let mut observed = self.observed.lock().unwrap();
        observed.releases += 1;
        observed.handler = None;
        if self.fail_release {
            return Err(TransportError::Worker("event loop task panicked".to_string()));
        }
        Ok(())
    }
}

fn confirm_disconnect(observed: &mut Observed) {
    observed.connected = false;
    if let Some(handler) = observed.handler.as_mut() {
        handler.on_disconnected(&DisconnectInfo::new(DisconnectReason::ClientRequested));
    }
}

fn options() -> ListenerOptions {
    ListenerOptions::builder()
        .client_id("bridge-test")
        .tcp_server("127.0.0.1")
        .build()
        .unwrap()
}

fn fast_config() -> ListenerConfig {
    ListenerConfig::builder()
        .connect_timeout_ms(100)
        .disconnect_timeout_ms(100)
        .poll_interval_ms(10)
        .build()
}

fn deliver(observed: &SharedObserved, message: ReceivedMessage) {
    let mut observed = observed.lock().unwrap();
    observed
        .handler
        .as_mut()
        .expect("transport not started")
        .on_message_received(message);
}

#[test]
fn test_default_bounds_are_fifteen_seconds() {
    let config = ListenerConfig::default();
    assert_eq!(config.connect_timeout, Duration::from_secs(15));
    assert_eq!(config.subscribe_timeout, Duration::from_secs(15));
    assert_eq!(config.disconnect_timeout, Duration::from_secs(15));
    assert_eq!(config.poll_interval, Duration::from_millis(200));
}

#[test]
fn test_start_returns_connected_listener() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Accept);

    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    assert_eq!(listener.state(), ConnectionState::Connected);
    assert_eq!(listener.client_id(), "bridge-test");
    assert_eq!(observed.lock().unwrap().releases, 0);

    listener.stop().unwrap();
    let observed = observed.lock().unwrap();
    assert_eq!(observed.stops, 1);
    assert_eq!(observed.releases, 1);
}

#[test]
fn test_connect_timeout_releases_transport() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Silent);

    let started = Instant::now();
    let result = Listener::start_with(transport, options(), fast_config());
    let elapsed = started.elapsed();

    match result {
        Err(ListenerError::ConnectTimeout {
            client_id,
            timeout_ms,
            ..
        }) => {
            assert_eq!(client_id, "bridge-test");
            assert_eq!(timeout_ms, 100);
        }
        Err(other) => panic!("Expected ConnectTimeout, got {:?}", other),
        Ok(_) => panic!("Expected ConnectTimeout, got a listener"),
    }
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert_eq!(observed.lock().unwrap().releases, 1);
}

#[test]
fn test_refused_connect_is_connect_error() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Refuse);

    let started = Instant::now();
    let result = Listener::start_with(transport, options(), ListenerConfig::default());

    match result {
        Err(ListenerError::ConnectError { cause, .. }) => {
            assert!(cause.to_string().contains("not authorized"), "{}", cause);
        }
        Err(other) => panic!("Expected ConnectError, got {:?}", other),
        Ok(_) => panic!("Expected ConnectError, got a listener"),
    }
    // A refusal must not wait for the 15 s connect bound.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(observed.lock().unwrap().releases, 1);
}

#[test]
fn test_start_failure_is_connect_error() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::FailStart);

    match Listener::start_with(transport, options(), fast_config()) {
        Err(ListenerError::ConnectError { cause, .. }) => {
            assert_eq!(cause, TransportError::ConnectionFailed("socket error".to_string()));
        }
        Err(other) => panic!("Expected ConnectError, got {:?}", other),
        Ok(_) => panic!("Expected ConnectError, got a listener"),
    }
    assert_eq!(observed.lock().unwrap().releases, 1);
}

#[test]
fn test_subscribe_all_is_ordered_and_fails_fast() {
    let (mut transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    transport.reject_topic = Some("c/+".to_string());
    let mut listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    let result = listener.subscribe_all(["a/b", "c/+", "d/#"]);

    match result {
        Err(ListenerError::SubscribeError { topic, .. }) => assert_eq!(topic, "c/+"),
        other => panic!("Expected SubscribeError, got {:?}", other),
    }
    assert_eq!(observed.lock().unwrap().subscribed, vec!["a/b", "c/+"]);

    // The connection survives a rejected filter.
    listener.subscribe("e/f").unwrap();
    assert_eq!(listener.state(), ConnectionState::Connected);
    listener.stop().unwrap();
}

#[test]
fn test_subscribe_all_succeeds_in_order() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    let mut listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    listener.subscribe_all(["a/b", "c/+"]).unwrap();

    assert_eq!(observed.lock().unwrap().subscribed, vec!["a/b", "c/+"]);
    listener.stop().unwrap();
}

#[test]
fn test_stop_skips_wait_when_connection_already_lost() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    {
        let mut observed = observed.lock().unwrap();
        observed.connected = false;
        observed
            .handler
            .as_mut()
            .unwrap()
            .on_disconnected(&DisconnectInfo::with_cause(
                DisconnectReason::ConnectionLost,
                "reset by peer",
            ));
    }
    assert_eq!(listener.state(), ConnectionState::Disconnected);
    assert_eq!(
        listener.last_disconnect().map(|info| info.reason),
        Some(DisconnectReason::ConnectionLost)
    );

    listener.stop().unwrap();
    let observed = observed.lock().unwrap();
    assert_eq!(observed.stops, 0);
    assert_eq!(observed.releases, 1);
}

#[test]
fn test_stop_waits_for_disconnect_from_transport_thread() {
    let delay = Duration::from_millis(50);
    let (mut transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    transport.disconnect = DisconnectScript::After(delay);
    let config = ListenerConfig::builder()
        .connect_timeout_ms(100)
        .disconnect_timeout_ms(2000)
        .poll_interval_ms(10)
        .build();
    let listener = Listener::start_with(transport, options(), config).unwrap();

    let started = Instant::now();
    let result = listener.stop();
    let elapsed = started.elapsed();

    assert!(result.is_ok(), "{:?}", result);
    assert!(elapsed >= delay, "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "took {:?}", elapsed);
    let observed = observed.lock().unwrap();
    assert_eq!(observed.stops, 1);
    assert_eq!(observed.releases, 1);
    assert!(!observed.connected);
}

#[test]
fn test_stop_times_out_without_confirmation() {
    let (mut transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    transport.disconnect = DisconnectScript::Never;
    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    let started = Instant::now();
    let result = listener.stop();

    assert!(matches!(result, Err(ListenerError::DisconnectTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(observed.lock().unwrap().releases, 1);
}

#[test]
fn test_release_failure_supersedes_wait_failure() {
    let (mut transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    transport.disconnect = DisconnectScript::Never;
    transport.fail_release = true;
    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    match listener.stop() {
        Err(ListenerError::DisconnectError {
            cause, superseded, ..
        }) => {
            assert!(matches!(cause, TransportError::Worker(_)));
            assert!(matches!(
                superseded.as_deref(),
                Some(ListenerError::DisconnectTimeout { .. })
            ));
        }
        other => panic!("Expected DisconnectError, got {:?}", other),
    }
    assert_eq!(observed.lock().unwrap().releases, 1);
}

#[test]
fn test_drop_releases_once() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    drop(listener);

    let observed = observed.lock().unwrap();
    assert_eq!(observed.stops, 1);
    assert_eq!(observed.releases, 1);
}

#[test]
fn test_messages_flow_from_transport_to_consumer() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();

    let producer_side = Arc::clone(&observed);
    let producer = thread::spawn(move || {
        for n in 1..=3 {
            deliver(
                &producer_side,
                ReceivedMessage::new(format!("m{}", n), vec![n as u8], QoS::AtMostOnce, false),
            );
            thread::sleep(Duration::from_millis(5));
        }
    });

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let ended = listener.run(&cancel, |message| {
        seen.push(message.topic().to_string());
        if seen.len() == 3 {
            cancel.cancel();
        }
        Ok(())
    });
    producer.join().unwrap();

    assert!(ended.unwrap_err().is_cancellation());
    assert_eq!(seen, vec!["m1", "m2", "m3"]);
    listener.stop().unwrap();
}

#[test]
fn test_message_stream_renders_payload_only_and_full() {
    let (transport, observed) = ScriptedTransport::new(ConnectScript::Accept);
    let listener = Listener::start_with(transport, options(), fast_config()).unwrap();
    deliver(
        &observed,
        ReceivedMessage::new("t", vec![0x68, 0x69], QoS::AtMostOnce, false),
    );

    let cancel = CancellationToken::new();
    let message = listener.messages(&cancel).next().unwrap();

    assert_eq!(
        OutputMode::PayloadOnly.render(message.clone()),
        OutputRecord::Payload("hi".to_string())
    );
    match OutputMode::Full.render(message) {
        OutputRecord::Message(record) => {
            assert_eq!(record.topic, "t");
            assert_eq!(record.payload.as_ref(), &[0x68, 0x69]);
            assert_eq!(record.qos, QoS::AtMostOnce);
            assert!(!record.retain);
        }
        other => panic!("Expected full record, got {:?}", other),
    }

    cancel.cancel();
    assert!(listener.messages(&cancel).next().is_none());
    listener.stop().unwrap();
}
