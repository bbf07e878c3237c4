//! Event fan-out.
//!
//! [`EventSource`] delivers each emitted value to synchronous listeners (in
//! registration order, on the emitting thread) and to any tokio broadcast
//! subscribers. Listeners are held weakly: dropping the returned [`Listener`]
//! guard unsubscribes. Emitters must not hold their own locks while emitting.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// Capacity of the broadcast side of every event source.
const BROADCAST_CAPACITY: usize = 256;

/// A clonable handle to one event stream.
pub struct EventSource<T> {
    inner: Arc<SourceInner<T>>,
}

struct SourceInner<T> {
    listeners: Mutex<Vec<Weak<Callback<T>>>>,
    tx: broadcast::Sender<T>,
}

/// Subscription guard returned by [`EventSource::listen`].
#[must_use = "dropping the listener unsubscribes it"]
pub struct Listener {
    _callback: Arc<dyn std::any::Any + Send + Sync>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Listener")
    }
}

impl<T: Clone + Send + 'static> EventSource<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(SourceInner {
                listeners: Mutex::new(Vec::new()),
                tx,
            }),
        }
    }

    /// Register a synchronous listener.
    pub fn listen<F>(&self, callback: F) -> Listener
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Arc<Callback<T>> = Arc::new(callback);
        self.inner.listeners.lock().push(Arc::downgrade(&callback));
        Listener {
            _callback: Arc::new(callback),
        }
    }

    /// Re-emit every value of this source on `target`.
    pub fn forward_to(&self, target: &EventSource<T>) -> Listener {
        let target = target.clone();
        self.listen(move |value| target.emit(value.clone()))
    }

    /// Subscribe through a tokio broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.inner.tx.subscribe()
    }

    /// Deliver `value` to all live listeners and subscribers.
    pub fn emit(&self, value: T) {
        let live: Vec<Arc<Callback<T>>> = {
            let mut listeners = self.inner.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for callback in live {
            callback(&value);
        }

        // No subscribers is not an error
        let _ = self.inner.tx.send(value);
    }

    /// Number of live synchronous listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}

impl<T: Clone + Send + 'static> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for EventSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("subscribers", &self.inner.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_listener_receives_values() {
        let source = EventSource::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        let _listener = source.listen(move |v| seen_clone.lock().push(*v));

        source.emit(1);
        source.emit(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let source = EventSource::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let listener = source.listen(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        source.emit(0);
        drop(listener);
        source.emit(0);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(source.listener_count(), 0);
    }

    #[test]
    fn test_forwarding() {
        let a = EventSource::<&'static str>::new();
        let b = EventSource::<&'static str>::new();
        let mut rx = b.subscribe();

        let _forward = a.forward_to(&b);
        a.emit("hello");

        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn test_listener_may_emit_reentrantly() {
        let source = EventSource::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_source = source.clone();
        let seen_clone = Arc::clone(&seen);
        let _listener = source.listen(move |v| {
            seen_clone.lock().push(*v);
            if *v == 0 {
                inner_source.emit(1);
            }
        });

        source.emit(0);
        assert_eq!(*seen.lock(), vec![0, 1]);
    }
}
