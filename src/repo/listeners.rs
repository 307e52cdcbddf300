//! Callback registries used for "something changed" notifications.
//!
//! Components never pass payloads to each other directly; they only announce
//! that new rows exist so the next stage can run without waiting for its timer.

use std::sync::{Arc, Mutex};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Listeners<E> {
    callbacks: Mutex<Vec<Callback<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Listeners<E> {
    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Call every listener synchronously on the caller's thread.
    pub fn notify(&self, event: &E) {
        // Clone out of the lock so a listener may register another listener.
        let callbacks: Vec<Callback<E>> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

/// A source row was inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAdded {
    pub source_id: i64,
    pub path: String,
}

/// A source has been examined and its items recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceExamined {
    pub source_id: i64,
}

/// An aggregation pass finished; `closed` aggregates became complete.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatesClosed {
    pub closed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_every_listener_is_called() {
        let listeners: Listeners<AggregatesClosed> = Listeners::default();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            listeners.add(move |e: &AggregatesClosed| {
                total.fetch_add(e.closed, Ordering::SeqCst);
            });
        }

        listeners.notify(&AggregatesClosed { closed: 2 });
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }
}
