//! Frame fan-out registry: one producer, many subscriber callbacks
//!
//! Each capture source owns one registry. Subscribers register a callback
//! and get back a stable id; ids are never reused within the lifetime of
//! the registry. Dispatch is synchronous on the producer thread, so
//! callbacks must hand frames off quickly (enqueue or drop) rather than
//! perform I/O inline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::frame::EncodedFrame;

/// Subscriber callback. Returning an error (or panicking) is logged and
/// isolated; it never disturbs other subscribers or the producer.
pub type FrameCallback = Box<dyn Fn(&EncodedFrame) -> Result<()> + Send + Sync>;

pub struct FanoutRegistry {
    subscribers: Mutex<Vec<(u64, FrameCallback)>>,
    next_id: AtomicU64,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a callback under a fresh, strictly increasing id.
    pub fn subscribe(&self, callback: FrameCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.lock().push((id, callback));
        id
    }

    /// Remove the callback registered under `id`; no-op if absent.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Remove every callback.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Deliver one frame to every current subscriber, in registration order.
    ///
    /// The registry lock is held for the whole iteration: callbacks must not
    /// call back into `subscribe`/`unsubscribe` on the same registry, they
    /// must defer such mutations.
    pub fn dispatch(&self, frame: &EncodedFrame) {
        let subscribers = self.subscribers.lock();
        for (id, callback) in subscribers.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(subscriber = id, error = %e, "frame callback failed"),
                Err(_) => error!(subscriber = id, "frame callback panicked"),
            }
        }
    }
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex as StdMutex};

    fn frame(n: u64) -> EncodedFrame {
        EncodedFrame::new(Bytes::from(vec![n as u8]), n, false)
    }

    #[test]
    fn test_ids_strictly_increase() {
        let registry = FanoutRegistry::new();
        let a = registry.subscribe(Box::new(|_| Ok(())));
        let b = registry.subscribe(Box::new(|_| Ok(())));
        registry.unsubscribe(a);
        let c = registry.subscribe(Box::new(|_| Ok(())));
        assert!(a < b && b < c, "ids must never be reused");
    }

    #[test]
    fn test_subscribe_unsubscribe_restores_registry() {
        let registry = FanoutRegistry::new();
        assert!(registry.is_empty());
        let id = registry.subscribe(Box::new(|_| Ok(())));
        assert_eq!(registry.len(), 1);
        registry.unsubscribe(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let registry = FanoutRegistry::new();
        let id = registry.subscribe(Box::new(|_| Ok(())));
        registry.unsubscribe(9999);
        assert_eq!(registry.len(), 1);
        registry.unsubscribe(id);
    }

    #[test]
    fn test_frames_delivered_in_order() {
        let registry = FanoutRegistry::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(Box::new(move |f| {
            sink.lock().unwrap().push(f.pts_ns);
            Ok(())
        }));

        for n in 0..10 {
            registry.dispatch(&frame(n));
        }
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_failing_callback_does_not_disturb_others() {
        let registry = FanoutRegistry::new();
        registry.subscribe(Box::new(|_| anyhow::bail!("subscriber is broken")));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(Box::new(move |f| {
            sink.lock().unwrap().push(f.pts_ns);
            Ok(())
        }));

        for n in 0..5 {
            registry.dispatch(&frame(n));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_callback_does_not_poison_registry() {
        let registry = FanoutRegistry::new();
        registry.subscribe(Box::new(|_| panic!("boom")));
        let seen = Arc::new(StdMutex::new(0u32));
        let sink = seen.clone();
        registry.subscribe(Box::new(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        }));

        registry.dispatch(&frame(0));
        registry.dispatch(&frame(1));
        assert_eq!(*seen.lock().unwrap(), 2);
        // The registry stays usable after the panic
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clear_removes_everything() {
        let registry = FanoutRegistry::new();
        registry.subscribe(Box::new(|_| Ok(())));
        registry.subscribe(Box::new(|_| Ok(())));
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribed_callback_sees_no_further_frames() {
        let registry = FanoutRegistry::new();
        let seen = Arc::new(StdMutex::new(0u32));
        let sink = seen.clone();
        let id = registry.subscribe(Box::new(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        }));

        registry.dispatch(&frame(0));
        registry.unsubscribe(id);
        registry.dispatch(&frame(1));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
