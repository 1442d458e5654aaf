//! Status subscriber set
//!
//! The set is snapshotted under its lock and listeners are called after the
//! lock is released, so a listener may subscribe or unsubscribe from inside
//! its own callback.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::{StatusEvent, StatusListener};

/// Fans backend status events out to subscribed sessions
#[derive(Default)]
pub struct StatusSubscribers {
    listeners: Mutex<Vec<(u64, Arc<dyn StatusListener>)>>,
}

impl StatusSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` under `key`, replacing any listener with that key.
    pub fn subscribe(&self, key: u64, listener: Arc<dyn StatusListener>) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|(k, _)| *k != key);
        listeners.push((key, listener));
    }

    pub fn unsubscribe(&self, key: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(k, _)| *k != key);
        listeners.len() != before
    }

    pub fn is_subscribed(&self, key: u64) -> bool {
        self.listeners.lock().iter().any(|(k, _)| *k == key)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl StatusListener for StatusSubscribers {
    fn on_status(&self, event: &StatusEvent) {
        let snapshot: Vec<Arc<dyn StatusListener>> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();

        for listener in snapshot {
            listener.on_status(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl StatusListener for Counter {
        fn on_status(&self, _event: &StatusEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Unsubscribes itself on the first event
    struct OneShot {
        key: u64,
        set: Weak<StatusSubscribers>,
        hits: AtomicUsize,
    }

    impl StatusListener for OneShot {
        fn on_status(&self, _event: &StatusEvent) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(set) = self.set.upgrade() {
                set.unsubscribe(self.key);
            }
        }
    }

    #[test]
    fn test_fan_out_and_replace() {
        let set = StatusSubscribers::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        set.subscribe(1, a.clone());
        set.subscribe(1, b.clone());
        set.subscribe(2, a.clone());

        set.on_status(&StatusEvent::volume(10));
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);

        assert!(set.unsubscribe(2));
        assert!(!set.unsubscribe(2));
        assert!(set.is_subscribed(1));
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let set = Arc::new(StatusSubscribers::new());
        let one_shot = Arc::new(OneShot {
            key: 5,
            set: Arc::downgrade(&set),
            hits: AtomicUsize::new(0),
        });
        set.subscribe(5, one_shot.clone());

        set.on_status(&StatusEvent::shuffle(true));
        set.on_status(&StatusEvent::shuffle(false));
        assert_eq!(one_shot.hits.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}
