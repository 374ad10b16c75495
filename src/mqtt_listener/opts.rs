// SPDX-License-Identifier: MPL-2.0

//! Transport configuration consumed by [`Listener::start`](super::Listener::start)

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::error::{ListenerError, ListenerResult};

pub const DEFAULT_TCP_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
/// The MQTT 5 client refuses anything shorter.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// Keep-alive travels as a 16-bit number of seconds.
pub const MAX_KEEP_ALIVE: Duration = Duration::from_secs(u16::MAX as u64);

/// MQTT protocol level used for CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1 (protocol level 4)
    V311,
    /// MQTT 5.0
    #[default]
    V5,
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3.1.1" | "311" | "4" => Ok(Self::V311),
            "5" | "5.0" | "500" => Ok(Self::V5),
            other => Err(format!(
                "unsupported protocol version '{}', expected 3.1.1 or 5",
                other
            )),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V311 => write!(f, "3.1.1"),
            Self::V5 => write!(f, "5"),
        }
    }
}

/// Where the broker lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
    },
    WebSocket {
        uri: String,
        headers: Vec<(String, String)>,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::WebSocket { uri, .. } => write!(f, "{}", uri),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip)]
    pub password: String,
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How strictly the broker's certificate is checked
///
/// Every relaxation is opt-in. The flags have no effect unless `use_tls` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TlsTrustPolicy {
    pub use_tls: bool,
    /// Accept certificates whose issuer is not in the trust store (self-signed).
    pub allow_untrusted: bool,
    /// Accept certificates with chain errors such as expiry or a bad signature.
    pub ignore_chain_errors: bool,
    /// Accept certificates that are revoked or whose revocation status is unknown.
    pub ignore_revocation_errors: bool,
}

impl TlsTrustPolicy {
    pub fn is_relaxed(&self) -> bool {
        self.allow_untrusted || self.ignore_chain_errors || self.ignore_revocation_errors
    }
}

/// Immutable transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerOptions {
    pub client_id: String,
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
    pub tls: TlsTrustPolicy,
    pub clean_session: bool,
    pub protocol_version: ProtocolVersion,
    pub keep_alive: Duration,
}

impl ListenerOptions {
    pub fn builder() -> ListenerOptionsBuilder {
        ListenerOptionsBuilder::default()
    }
}

/// Builder for [`ListenerOptions`]; `build` validates the combination.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptionsBuilder {
    client_id: Option<String>,
    server: Option<String>,
    port: Option<u16>,
    uri: Option<String>,
    headers: Vec<(String, String)>,
    username: Option<String>,
    password: Option<String>,
    tls: TlsTrustPolicy,
    clean_session: bool,
    protocol_version: ProtocolVersion,
    keep_alive: Option<Duration>,
}

impl ListenerOptionsBuilder {
    /// Client identifier; one is generated when unset or empty.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Connect over plain TCP (or TLS over TCP) to `host`.
    pub fn tcp_server(mut self, host: impl Into<String>) -> Self {
        self.server = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Connect over WebSocket to a `ws://` or `wss://` URI.
    pub fn websocket_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Add a header to the WebSocket upgrade request.
    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn use_tls(mut self, enable: bool) -> Self {
        self.tls.use_tls = enable;
        self
    }

    pub fn allow_untrusted_certificates(mut self, allow: bool) -> Self {
        self.tls.allow_untrusted = allow;
        self
    }

    pub fn ignore_certificate_chain_errors(mut self, ignore: bool) -> Self {
        self.tls.ignore_chain_errors = ignore;
        self
    }

    pub fn ignore_certificate_revocation_errors(mut self, ignore: bool) -> Self {
        self.tls.ignore_revocation_errors = ignore;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn build(self) -> ListenerResult<ListenerOptions> {
        let mut tls = self.tls;
        let endpoint = match (self.server, self.uri) {
            (Some(_), Some(_)) => {
                return Err(ListenerError::invalid_configuration(
                    "endpoint",
                    "a TCP server and a WebSocket URI are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(ListenerError::invalid_configuration(
                    "endpoint",
                    "either a TCP server or a WebSocket URI is required",
                ))
            }
            (Some(host), None) => {
                if host.trim().is_empty() {
                    return Err(ListenerError::invalid_configuration(
                        "server",
                        "must not be empty",
                    ));
                }
                if !self.headers.is_empty() {
                    return Err(ListenerError::invalid_configuration(
                        "headers",
                        "request headers only apply to WebSocket endpoints",
                    ));
                }
                let port = match self.port {
                    Some(0) => {
                        return Err(ListenerError::invalid_configuration(
                            "port",
                            "must not be zero",
                        ))
                    }
                    Some(port) => port,
                    None if tls.use_tls => DEFAULT_TLS_PORT,
                    None => DEFAULT_TCP_PORT,
                };
                Endpoint::Tcp { host, port }
            }
            (None, Some(uri)) => {
                if self.port.is_some() {
                    return Err(ListenerError::invalid_configuration(
                        "port",
                        "the port of a WebSocket endpoint is part of its URI",
                    ));
                }
                if uri.starts_with("wss://") {
                    tls.use_tls = true;
                } else if !uri.starts_with("ws://") {
                    return Err(ListenerError::invalid_configuration(
                        "uri",
                        format!("'{}' is not a ws:// or wss:// URI", uri),
                    ));
                }
                Endpoint::WebSocket {
                    uri,
                    headers: self.headers,
                }
            }
        };

        let username = self.username.filter(|u| !u.is_empty());
        let password = self.password.filter(|p| !p.is_empty());
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (Some(_), None) => {
                return Err(ListenerError::invalid_configuration(
                    "password",
                    "a username requires a password",
                ))
            }
            (None, Some(_)) => {
                return Err(ListenerError::invalid_configuration(
                    "username",
                    "a password requires a username",
                ))
            }
            (None, None) => None,
        };

        if !tls.use_tls && tls.is_relaxed() {
            tracing::warn!("certificate trust flags have no effect without TLS");
            tls = TlsTrustPolicy::default();
        }

        let keep_alive = self.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE);
        if !(MIN_KEEP_ALIVE..=MAX_KEEP_ALIVE).contains(&keep_alive) {
            return Err(ListenerError::invalid_configuration(
                "keep_alive",
                format!(
                    "must be between {} and {} seconds",
                    MIN_KEEP_ALIVE.as_secs(),
                    MAX_KEEP_ALIVE.as_secs()
                ),
            ));
        }

        let client_id = match self.client_id {
            Some(id) if !id.is_empty() => id,
            _ => generate_client_id(),
        };

        Ok(ListenerOptions {
            client_id,
            endpoint,
            credentials,
            tls,
            clean_session: self.clean_session,
            protocol_version: self.protocol_version,
            keep_alive,
        })
    }
}

fn generate_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("mqtt-listener-{}-{:08x}", std::process::id(), nanos)
}
