// SPDX-License-Identifier: MPL-2.0

//! Subscribe to MQTT topics and print every received message on stdout.
//!
//! Runs until Ctrl+C. Logs go to stderr.

use std::error::Error;
use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mqtt_listener::mqtt_listener::{
    Listener, ListenerError, ListenerOptions, OutputMode, ProtocolVersion, RecordWriter,
};

#[derive(Parser, Debug)]
#[command(name = "mqtt-listen", version, about = "Print messages received on MQTT topics")]
struct Args {
    /// Client identifier (generated when omitted)
    #[arg(long, env = "MQTT_LISTENER_CLIENT_ID")]
    client_id: Option<String>,

    /// Broker host for TCP connections
    #[arg(
        long,
        env = "MQTT_LISTENER_SERVER",
        conflicts_with = "uri",
        required_unless_present = "uri"
    )]
    server: Option<String>,

    /// Broker port (default 1883, or 8883 with --tls)
    #[arg(long, env = "MQTT_LISTENER_PORT", requires = "server")]
    port: Option<u16>,

    /// WebSocket endpoint, ws:// or wss://
    #[arg(long)]
    uri: Option<String>,

    /// Extra WebSocket request header, NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header, requires = "uri")]
    headers: Vec<(String, String)>,

    #[arg(long, env = "MQTT_LISTENER_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_LISTENER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// Accept broker certificates from unknown issuers
    #[arg(long)]
    allow_untrusted_certificates: bool,

    /// Accept broker certificates with chain errors
    #[arg(long)]
    ignore_certificate_chain_errors: bool,

    /// Accept revoked broker certificates or unknown revocation status
    #[arg(long)]
    ignore_certificate_revocation_errors: bool,

    /// Start a clean session
    #[arg(long)]
    clean_session: bool,

    /// MQTT protocol version: 3.1.1 or 5
    #[arg(long, default_value = "5")]
    protocol_version: ProtocolVersion,

    /// Keep-alive interval in seconds
    #[arg(long, default_value_t = 60)]
    keep_alive: u16,

    /// Print only the payload text of each message
    #[arg(long)]
    only_payload: bool,

    /// Topic filter to subscribe to (repeatable)
    #[arg(long = "topic", short = 't', required = true)]
    topics: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

fn build_options(args: &Args) -> Result<ListenerOptions, ListenerError> {
    let mut builder = ListenerOptions::builder()
        .use_tls(args.tls)
        .allow_untrusted_certificates(args.allow_untrusted_certificates)
        .ignore_certificate_chain_errors(args.ignore_certificate_chain_errors)
        .ignore_certificate_revocation_errors(args.ignore_certificate_revocation_errors)
        .clean_session(args.clean_session)
        .protocol_version(args.protocol_version)
        .keep_alive(Duration::from_secs(args.keep_alive.into()));

    if let Some(client_id) = &args.client_id {
        builder = builder.client_id(client_id);
    }
    if let Some(server) = &args.server {
        builder = builder.tcp_server(server);
    }
    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    if let Some(uri) = &args.uri {
        builder = builder.websocket_uri(uri);
        for (name, value) in &args.headers {
            builder = builder.request_header(name, value);
        }
    }
    if let Some(username) = &args.username {
        builder = builder.username(username);
    }
    if let Some(password) = &args.password {
        builder = builder.password(password);
    }
    builder.build()
}

fn listen(args: Args, cancel: CancellationToken) -> Result<(), ListenerError> {
    let options = build_options(&args)?;
    let mode = OutputMode::from_only_payload(args.only_payload);

    let mut listener = Listener::start(options)?;
    if let Err(e) = listener.subscribe_all(&args.topics) {
        if let Err(stop_error) = listener.stop() {
            error!("{}", stop_error);
        }
        return Err(e);
    }

    let mut writer = RecordWriter::new(io::stdout().lock());
    let ended = listener.run(&cancel, |message| writer.write(&mode.render(message)));
    drop(writer);

    let stopped = listener.stop();
    match ended {
        Err(e) if e.is_cancellation() => {
            info!("{}", e.user_message());
            stopped
        }
        Err(e) => {
            if let Err(stop_error) = stopped {
                error!("{}", stop_error);
            }
            Err(e)
        }
        Ok(never) => match never {},
    }
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl-C, stopping");
        on_interrupt.cancel();
    })?;

    match listen(args, cancel) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
