//! Cancellation tokens for promises and combinators
//!
//! A token starts live and can be canceled exactly once. Callbacks registered
//! before cancellation run on the canceling thread; callbacks registered after
//! it run immediately on the registering thread. Registration never blocks.
//!
//! Every registration hands back a [`Registration`]. Work that finishes
//! without being canceled unregisters its callback, so a long-lived token
//! only holds callbacks for work that is still outstanding.

use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

type Callback = Box<dyn FnOnce() + Send + Sync + 'static>;

/// A token that can be used to signal cancellation to pending work
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: DashMap<u64, Callback>,
}

impl CancellationToken {
    /// Create a new cancellation token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: DashMap::new(),
            }),
        }
    }

    /// A token that is already canceled
    pub fn canceled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    /// Cancel the token and run every registered callback
    ///
    /// Only the first call has any effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        fence(Ordering::SeqCst);
        self.inner.drain();
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Run `callback` once the token is canceled
    ///
    /// If the token was already canceled the callback has run before this
    /// returns, and the returned registration reports
    /// [`is_fired`](Registration::is_fired).
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, Box::new(callback));
        // Pairs with the fence in `cancel`: either we observe the flag or the
        // canceling thread observes our callback.
        fence(Ordering::SeqCst);
        let fired = self.is_cancelled();
        if fired {
            self.inner.drain();
        }
        Registration {
            token: Arc::downgrade(&self.inner),
            id,
            fired,
        }
    }

    /// Number of callbacks still waiting for cancellation
    pub fn registered(&self) -> usize {
        self.inner.callbacks.len()
    }
}

impl Inner {
    fn drain(&self) {
        // Collect first: a callback must not run while its shard is locked
        let ids: Vec<u64> = self.callbacks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, callback)) = self.callbacks.remove(&id) {
                callback();
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("callbacks", &self.registered())
            .finish()
    }
}

/// A callback registered with a [`CancellationToken`]
///
/// Dropping a registration leaves the callback armed; call
/// [`unregister`](Self::unregister) once the guarded work is done.
#[derive(Clone)]
pub struct Registration {
    token: Weak<Inner>,
    id: u64,
    fired: bool,
}

impl Registration {
    /// Remove the callback from its token
    ///
    /// Returns `true` if the callback was still armed. Calling this after
    /// the callback ran, or more than once, does nothing.
    pub fn unregister(&self) -> bool {
        match self.token.upgrade() {
            Some(inner) => inner.callbacks.remove(&self.id).is_some(),
            None => false,
        }
    }

    /// Whether the token was already canceled at registration
    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("fired", &self.fired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            let registration = token.register(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            assert!(!registration.is_fired());
        }
        assert_eq!(token.registered(), 3);

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancellationToken::canceled();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let registration = token.register(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registration.is_fired());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!registration.unregister());
    }

    #[test]
    fn test_unregistered_callback_never_runs() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let registration = token.register(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registration.unregister());
        assert!(!registration.unregister());
        assert_eq!(token.registered(), 0);

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_after_token_dropped() {
        let token = CancellationToken::new();
        let registration = token.register(|| {});
        drop(token);
        assert!(!registration.unregister());
    }

    #[test]
    fn test_concurrent_register_and_cancel_never_loses_callback() {
        for _ in 0..200 {
            let token = CancellationToken::new();
            let hits = Arc::new(AtomicUsize::new(0));

            let registrar = {
                let token = token.clone();
                let hits = hits.clone();
                thread::spawn(move || {
                    token.register(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                })
            };
            token.cancel();
            registrar.join().unwrap();

            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }
}
