// SPDX-License-Identifier: MPL-2.0

//! Timing configuration for the bridge and the consumption loop

use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded waits used by [`Listener`](super::Listener)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// How long `start` waits for the connected confirmation
    pub connect_timeout: Duration,
    /// How long `subscribe` waits for the broker's acknowledgment
    pub subscribe_timeout: Duration,
    /// How long `stop` waits for the disconnected confirmation
    pub disconnect_timeout: Duration,
    /// How long each inbox take waits before cancellation is checked again
    pub poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            connect_timeout: CONNECT_TIMEOUT,
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            disconnect_timeout: DISCONNECT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl ListenerConfig {
    pub fn builder() -> ListenerConfigBuilder {
        ListenerConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ListenerConfigBuilder {
    config: ListenerConfig,
}

impl ListenerConfigBuilder {
    pub fn connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.connect_timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn subscribe_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.subscribe_timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn disconnect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.disconnect_timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.poll_interval = Duration::from_millis(interval_ms);
        self
    }

    pub fn build(self) -> ListenerConfig {
        self.config
    }
}
