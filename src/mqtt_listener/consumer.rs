// SPDX-License-Identifier: MPL-2.0

//! Consumption loop
//!
//! Drains the inbox one message at a time, waiting at most one poll interval
//! per take so that cancellation is observed promptly. Messages still buffered
//! when cancellation is observed are discarded.

use std::convert::Infallible;
use std::io;
use std::iter::FusedIterator;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::error::{ListenerError, ListenerResult};
use super::inbox::Inbox;
use super::message::ReceivedMessage;

enum Step {
    Message(ReceivedMessage),
    Idle,
    /// Cancellation observed; carries how many taken messages were dropped.
    Cancelled(usize),
}

fn step(inbox: &Inbox, cancel: &CancellationToken, poll_interval: Duration) -> Step {
    if cancel.is_cancelled() {
        return Step::Cancelled(0);
    }
    match inbox.take_timeout(poll_interval) {
        None => Step::Idle,
        // Cancelled while waiting: the message in hand is not emitted.
        Some(_) if cancel.is_cancelled() => Step::Cancelled(1),
        Some(message) => Step::Message(message),
    }
}

fn finish(inbox: &Inbox, in_hand: usize, delivered: u64) {
    let discarded = in_hand + inbox.discard_pending();
    info!(delivered, discarded, "Consumption cancelled");
}

/// Emit every message until `cancel` fires.
///
/// `emit` is called exactly once per message, in arrival order. The loop ends
/// with [`ListenerError::Cancelled`] on cancellation, or with
/// [`ListenerError::OutputError`] if `emit` fails.
pub fn run<F>(
    inbox: &Inbox,
    cancel: &CancellationToken,
    poll_interval: Duration,
    mut emit: F,
) -> ListenerResult<Infallible>
where
    F: FnMut(ReceivedMessage) -> io::Result<()>,
{
    let mut delivered: u64 = 0;
    loop {
        match step(inbox, cancel, poll_interval) {
            Step::Message(message) => {
                trace!(topic = message.topic(), bytes = message.payload().len(), "Emitting");
                emit(message)?;
                delivered += 1;
            }
            Step::Idle => {}
            Step::Cancelled(in_hand) => {
                finish(inbox, in_hand, delivered);
                return Err(ListenerError::Cancelled);
            }
        }
    }
}

/// Iterator over received messages that ends when its token is cancelled.
pub struct MessageStream<'a> {
    inbox: &'a Inbox,
    cancel: CancellationToken,
    poll_interval: Duration,
    delivered: u64,
    done: bool,
}

impl<'a> MessageStream<'a> {
    pub fn new(inbox: &'a Inbox, cancel: CancellationToken, poll_interval: Duration) -> Self {
        Self {
            inbox,
            cancel,
            poll_interval,
            delivered: 0,
            done: false,
        }
    }
}

impl Iterator for MessageStream<'_> {
    type Item = ReceivedMessage;

    fn next(&mut self) -> Option<ReceivedMessage> {
        if self.done {
            return None;
        }
        loop {
            match step(self.inbox, &self.cancel, self.poll_interval) {
                Step::Message(message) => {
                    self.delivered += 1;
                    return Some(message);
                }
                Step::Idle => {}
                Step::Cancelled(in_hand) => {
                    self.done = true;
                    finish(self.inbox, in_hand, self.delivered);
                    return None;
                }
            }
        }
    }
}

impl FusedIterator for MessageStream<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_listener::message::QoS;
    use std::thread;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(20);

    fn msg(topic: &str) -> ReceivedMessage {
        ReceivedMessage::new(topic, topic.as_bytes().to_vec(), QoS::AtMostOnce, false)
    }

    #[test]
    fn test_emits_in_arrival_order() {
        let (tx, inbox) = Inbox::channel();
        for topic in ["m1", "m2", "m3"] {
            tx.push(msg(topic));
        }
        let cancel = CancellationToken::new();

        let mut seen = Vec::new();
        let result = run(&inbox, &cancel, POLL, |message| {
            seen.push(message.topic().to_string());
            if seen.len() == 3 {
                cancel.cancel();
            }
            Ok(())
        });

        assert!(result.unwrap_err().is_cancellation());
        assert_eq!(seen, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_cancelled_before_any_message() {
        let (tx, inbox) = Inbox::channel();
        tx.push(msg("never"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let mut emitted = 0;
        let result = run(&inbox, &cancel, Duration::from_secs(5), |_| {
            emitted += 1;
            Ok(())
        });

        assert!(result.unwrap_err().is_cancellation());
        assert_eq!(emitted, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(inbox.try_take().is_none(), "buffered messages are discarded");
    }

    #[test]
    fn test_cancelled_between_dequeues() {
        let (tx, inbox) = Inbox::channel();
        tx.push(msg("first"));
        tx.push(msg("second"));
        let cancel = CancellationToken::new();

        let mut seen = Vec::new();
        let result = run(&inbox, &cancel, POLL, |message| {
            seen.push(message.topic().to_string());
            cancel.cancel();
            Ok(())
        });

        assert!(result.unwrap_err().is_cancellation());
        assert_eq!(seen, vec!["first"]);
    }

    #[test]
    fn test_cancellation_from_another_thread_while_idle() {
        let (_tx, inbox) = Inbox::channel();
        let cancel = CancellationToken::new();
        let remote = cancel.clone();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        let result = run(&inbox, &cancel, POLL, |_| Ok(()));
        canceller.join().unwrap();

        assert!(result.unwrap_err().is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_emit_failure_ends_loop() {
        let (tx, inbox) = Inbox::channel();
        tx.push(msg("a"));
        let cancel = CancellationToken::new();

        let result = run(&inbox, &cancel, POLL, |_| {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
        });

        match result {
            Err(ListenerError::OutputError { message }) => {
                assert!(message.contains("stdout closed"))
            }
            other => panic!("Expected OutputError, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_message_stream_ends_on_cancel() {
        let (tx, inbox) = Inbox::channel();
        tx.push(msg("x"));
        tx.push(msg("y"));
        let cancel = CancellationToken::new();

        let mut stream = MessageStream::new(&inbox, cancel.clone(), POLL);
        assert_eq!(stream.next().unwrap().topic(), "x");
        assert_eq!(stream.next().unwrap().topic(), "y");

        cancel.cancel();
        assert!(stream.next().is_none());
        tx.push(msg("z"));
        assert!(stream.next().is_none());
    }
}
