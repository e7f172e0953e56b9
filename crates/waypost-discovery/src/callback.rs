//! Single-fire completion callbacks.
//!
//! Async lookups race a backend response against a timeout. Both sides
//! hold a clone of the same `Callback`; whichever completes first fires
//! it and the other is discarded.

use std::sync::{Arc, Mutex};

use waypost_core::DiscoveryResult;

type Handler<T> = Box<dyn FnOnce(DiscoveryResult<T>) + Send>;

pub struct Callback<T> {
    handler: Arc<Mutex<Option<Handler<T>>>>,
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<T> Callback<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(DiscoveryResult<T>) + Send + 'static,
    {
        Self {
            handler: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// Fire the callback with `result`.
    ///
    /// Returns false, dropping `result`, when another clone already fired.
    pub fn complete(&self, result: DiscoveryResult<T>) -> bool {
        let handler = self.handler.lock().expect("callback lock").take();
        match handler {
            // Run outside the lock so the handler may touch this callback.
            Some(handler) => {
                handler(result);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.handler.lock().expect("callback lock").is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use waypost_core::DiscoveryError;

    #[test]
    fn fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = Callback::new(move |result: DiscoveryResult<u32>| {
            assert_eq!(result, Ok(7));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let late = callback.clone();
        assert!(!callback.is_completed());
        assert!(callback.complete(Ok(7)));
        assert!(!late.complete(Err(DiscoveryError::Backend("late".to_string()))));
        assert!(late.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn racing_threads_fire_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = Callback::new(move |_: DiscoveryResult<()>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let callback = callback.clone();
                std::thread::spawn(move || callback.complete(Ok(())))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();

        assert_eq!(fired, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
