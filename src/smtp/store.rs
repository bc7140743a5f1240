//! Thread-safe storage for captured messages

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::warn;

use crate::smtp::error::SmtpError;
use crate::smtp::message::MailMessage;

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<MailMessage>,
    closed: bool,
}

/// Ordered collection of every message the server has accepted
///
/// Shared between all connection handlers and the test thread. A single
/// lock guards the list; waiters are woken on every append.
#[derive(Debug, Default)]
pub struct MessageStore {
    inner: Mutex<Inner>,
    arrived: Condvar,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message at the end of the list
    ///
    /// Returns false, dropping the message, once the store has been closed
    /// by a server shutdown.
    pub fn append(&self, message: MailMessage) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            warn!("Discarding message from {:?}: server stopped", message.sender());
            return false;
        }
        inner.messages.push(message);
        drop(inner);

        self.arrived.notify_all();
        true
    }

    pub fn count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Get a copy of the message at `index`, in arrival order
    pub fn get(&self, index: usize) -> Result<MailMessage, SmtpError> {
        let inner = self.lock();
        inner
            .messages
            .get(index)
            .cloned()
            .ok_or(SmtpError::IndexOutOfRange {
                index,
                count: inner.messages.len(),
            })
    }

    /// Snapshot of all messages in arrival order
    pub fn messages(&self) -> Vec<MailMessage> {
        self.lock().messages.clone()
    }

    /// Block until at least `target` messages are stored or `timeout` passes
    ///
    /// Reaching the timeout is not an error: the count at return time is
    /// handed back and the caller decides what to make of it.
    pub fn wait_for_count(&self, target: usize, timeout: Duration) -> usize {
        let inner = self.lock();
        let (inner, _) = self
            .arrived
            .wait_timeout_while(inner, timeout, |inner| inner.messages.len() < target)
            .unwrap_or_else(PoisonError::into_inner);
        inner.messages.len()
    }

    pub fn clear(&self) {
        self.lock().messages.clear();
    }

    /// Refuse any further appends
    pub fn close(&self) {
        self.lock().closed = true;
        self.arrived.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The list is never left half-updated, so a poisoned lock is safe
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
