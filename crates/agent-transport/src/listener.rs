//! Listener traits and the per-instance registries that hold them.

use crate::{Destination, TransportState, UnsentReason};
use parking_lot::RwLock;
use std::sync::Arc;

/// Receives transport liveness transitions.
pub trait TransportStateListener: Send + Sync {
    fn on_state_alive(&self);

    fn on_state_failed(&self) {}
}

/// Receives the final outcome of every message handed to a sender.
///
/// Each accepted or rejected message produces exactly one call.
pub trait MessageSendingListener: Send + Sync {
    fn on_sent(&self, destination: &Destination, payload: &[u8]);

    fn on_unsent(&self, destination: &Destination, payload: &[u8], reason: UnsentReason);
}

/// Append-only set of listeners owned by one component instance.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener. Registering the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<L>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot so callbacks run without holding the lock.
    fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.read().clone()
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry<dyn TransportStateListener> {
    pub fn notify(&self, state: TransportState) {
        for listener in self.snapshot() {
            match state {
                TransportState::Alive => listener.on_state_alive(),
                TransportState::Failed => listener.on_state_failed(),
            }
        }
    }
}

impl ListenerRegistry<dyn MessageSendingListener> {
    pub fn sent(&self, destination: &Destination, payload: &[u8]) {
        for listener in self.snapshot() {
            listener.on_sent(destination, payload);
        }
    }

    pub fn unsent(&self, destination: &Destination, payload: &[u8], reason: UnsentReason) {
        for listener in self.snapshot() {
            listener.on_unsent(destination, payload, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        alive: AtomicUsize,
        failed: AtomicUsize,
    }

    impl TransportStateListener for Counting {
        fn on_state_alive(&self) {
            self.alive.fetch_add(1, Ordering::SeqCst);
        }

        fn on_state_failed(&self) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registry_ignores_duplicate_registration() {
        let registry: ListenerRegistry<dyn TransportStateListener> = ListenerRegistry::new();
        let listener = Arc::new(Counting::default());

        registry.add(listener.clone());
        registry.add(listener.clone());
        assert_eq!(registry.len(), 1);

        registry.notify(TransportState::Alive);
        assert_eq!(listener.alive.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registries_do_not_share_listeners() {
        let first: ListenerRegistry<dyn TransportStateListener> = ListenerRegistry::new();
        let second: ListenerRegistry<dyn TransportStateListener> = ListenerRegistry::new();
        let listener = Arc::new(Counting::default());

        first.add(listener.clone());
        second.notify(TransportState::Failed);

        assert!(second.is_empty());
        assert_eq!(listener.failed.load(Ordering::SeqCst), 0);
    }
}
