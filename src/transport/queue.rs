//! Outbound message queue shared by callers and the transport loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::protocol::Message;

/// Mutex-guarded outbound queue.
///
/// Clones share the same queue. Pushing is a no-op while the owning
/// transport is not running.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    messages: Arc<Mutex<Vec<Message>>>,
    running: Arc<AtomicBool>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message. Returns false if it was dropped because the
    /// transport is not running.
    pub fn push(&self, message: Message) -> bool {
        if !self.is_running() {
            return false;
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        true
    }

    /// Swap in an empty queue and return what was queued, or `None` if
    /// nothing was.
    pub fn pop_all(&self) -> Option<Vec<Message>> {
        let batch = std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}
