// SPDX-License-Identifier: MPL-2.0

//! Blocking, cancellable MQTT subscriptions
//!
//! [`Listener`](mqtt_listener::Listener) connects to a broker, subscribes to
//! topic filters and hands received messages to a synchronous consumer in
//! arrival order until a cancellation token fires.
//!
//! ```no_run
//! use mqtt_listener::mqtt_listener::{Listener, ListenerOptions, OutputMode, RecordWriter};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ListenerOptions::builder()
//!     .tcp_server("broker.emqx.io")
//!     .build()?;
//! let mut listener = Listener::start(options)?;
//! listener.subscribe_all(["sensors/+/temperature"])?;
//!
//! let cancel = CancellationToken::new();
//! let mut writer = RecordWriter::new(std::io::stdout());
//! let ended = listener.run(&cancel, |message| writer.write(&OutputMode::Full.render(message)));
//! listener.stop()?;
//! # let _ = ended;
//! # Ok(())
//! # }
//! ```

pub mod mqtt_listener;
