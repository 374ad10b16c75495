// SPDX-License-Identifier: MPL-2.0

//! Ordered buffer between transport delivery and loop consumption
//!
//! The transport appends from its own execution context through an
//! [`InboxSender`]; the owner takes messages from the [`Inbox`] with a bounded
//! wait. Appending never blocks and the buffer is unbounded.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::message::ReceivedMessage;

/// Producer side of the inbox. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InboxSender {
    tx: Sender<ReceivedMessage>,
}

impl InboxSender {
    /// Append a message. Returns false if the inbox has been dropped.
    pub fn push(&self, message: ReceivedMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Consumer side of the inbox, owned by the connection.
#[derive(Debug)]
pub struct Inbox {
    rx: Receiver<ReceivedMessage>,
}

impl Inbox {
    /// Create an inbox and the sender handed to the transport.
    pub fn channel() -> (InboxSender, Inbox) {
        let (tx, rx) = mpsc::channel();
        (InboxSender { tx }, Inbox { rx })
    }

    /// Take the oldest message, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` if nothing arrived in time. Once every sender is gone and
    /// the buffer is drained this also returns `None`, after the same wait, so
    /// callers polling for cancellation keep their pacing.
    pub fn take_timeout(&self, timeout: Duration) -> Option<ReceivedMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                None
            }
        }
    }

    /// Take the oldest message without waiting.
    pub fn try_take(&self) -> Option<ReceivedMessage> {
        self.rx.try_recv().ok()
    }

    /// Drop everything currently buffered and return how many messages were discarded.
    pub fn discard_pending(&self) -> usize {
        self.rx.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_listener::message::QoS;
    use std::thread;
    use std::time::Instant;

    fn msg(topic: &str, n: u8) -> ReceivedMessage {
        ReceivedMessage::new(topic, vec![n], QoS::AtMostOnce, false)
    }

    #[test]
    fn test_fifo_order_across_threads() {
        let (tx, inbox) = Inbox::channel();

        let producer = thread::spawn(move || {
            for n in 0..100u8 {
                assert!(tx.push(msg("seq", n)));
            }
        });
        producer.join().unwrap();

        for n in 0..100u8 {
            let received = inbox.take_timeout(Duration::from_millis(100)).unwrap();
            assert_eq!(received.payload().as_ref(), &[n]);
        }
        assert!(inbox.try_take().is_none());
    }

    #[test]
    fn test_take_timeout_returns_none_when_empty() {
        let (_tx, inbox) = Inbox::channel();
        let started = Instant::now();

        assert!(inbox.take_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_take_timeout_keeps_pacing_after_senders_drop() {
        let (tx, inbox) = Inbox::channel();
        drop(tx);
        let started = Instant::now();

        assert!(inbox.take_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_discard_pending_counts_buffered_messages() {
        let (tx, inbox) = Inbox::channel();
        tx.push(msg("a", 1));
        tx.push(msg("a", 2));
        tx.push(msg("a", 3));

        assert_eq!(inbox.discard_pending(), 3);
        assert!(inbox.try_take().is_none());
    }

    #[test]
    fn test_push_fails_after_inbox_dropped() {
        let (tx, inbox) = Inbox::channel();
        drop(inbox);
        assert!(!tx.push(msg("gone", 0)));
    }
}
