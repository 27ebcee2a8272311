//! Event bus the UI layer subscribes to.
//!
//! The core only emits; delivery is a plain unbounded channel per
//! subscriber. Subscribers that dropped their receiver are pruned on the
//! next emit.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::session_keys::SessionKeysStatus;

/// Changes to stored data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    ConversationCreated { phone: String },
    ConversationDeleted { phone: String },
    MessageStored { phone: String },
    SessionKeysChanged { phone: String, status: SessionKeysStatus },
    /// The store hit an unrecoverable error and refuses further operations
    Fatal,
}

/// Fan-out of events of type `E` to every live subscriber
pub struct EventBus<E> {
    subscribers: Mutex<Vec<Sender<E>>>,
}

impl<E: Clone> EventBus<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// New receiver that sees every event emitted from now on
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(StorageEvent::Fatal);

        assert_eq!(a.try_recv().unwrap(), StorageEvent::Fatal);
        assert_eq!(b.try_recv().unwrap(), StorageEvent::Fatal);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus: EventBus<u32> = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.emit(1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), 1);
    }
}
