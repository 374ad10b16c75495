// SPDX-License-Identifier: MPL-2.0

//! Single-slot confirmation signals
//!
//! A [`ConfirmationSignal`] lets one execution context block until another one
//! reports a state transition. The signaler stores a value in the slot, the
//! waiter takes it out. Taking the value resets the signal, so every set is
//! consumed by at most one wait.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Binary handoff between a transport event handler and a blocked caller.
#[derive(Debug)]
pub struct ConfirmationSignal<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> ConfirmationSignal<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Store `value` and wake any waiter.
    ///
    /// A value that was set but never consumed is replaced.
    pub fn set(&self, value: T) {
        let mut slot = self.lock();
        *slot = Some(value);
        self.cond.notify_all();
    }

    /// Clear the slot, returning the value that was pending, if any.
    pub fn reset(&self) -> Option<T> {
        self.lock().take()
    }

    /// Returns true if a value is waiting to be consumed.
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Block until the signal is set or `timeout` elapses.
    ///
    /// Returns the consumed value, or `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self.lock();
        let (mut slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }

    // A handler that panicked while holding the lock leaves a plain Option behind,
    // which is still consistent.
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for ConfirmationSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}
