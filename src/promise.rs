//! Promise and deferred handles
//!
//! A [`Deferred`] is the producer side of an operation and a [`Promise`] the
//! consumer side. Both carry the generation of the node they were issued
//! for; every operation checks it before touching the node.
//!
//! Promises are single-use. Consuming one (attaching a continuation,
//! waiting, awaiting, or handing it to a combinator) moves it. A promise
//! that has been [`preserve`](Promise::preserve)d may be
//! [`duplicate`](Promise::duplicate)d so several consumers can each observe
//! the same outcome.
//!
//! # Examples
//!
//! ```rust
//! use rust_deferred::{Deferred, Dispatch, Outcome};
//!
//! let (deferred, promise) = Deferred::<u32>::new();
//! let doubled = promise
//!     .continue_with(Dispatch::Synchronous, None, |outcome| outcome.map(|v| v * 2))
//!     .unwrap();
//!
//! deferred.resolve(21).unwrap();
//! assert_eq!(doubled.wait(), Outcome::Resolved(42));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use futures::task::{self, ArcWake, AtomicWaker};

use crate::cancellation::{CancellationToken, Registration};
use crate::config::{self, Config};
use crate::continuation::Waiter;
use crate::dispatch::{Dispatch, Target};
use crate::error::{PromiseError, Result};
use crate::future::PromiseFuture;
use crate::node::{PromiseNode, ALREADY_CONSUMED, STALE_HANDLE};
use crate::pool::{NodeId, NodePool};
use crate::state::{Outcome, Reason, SettlementState};
use crate::Value;

/// Identity of a promise handle
///
/// Inline promises have no node. Node-backed handles are only equal when
/// they were issued for the same occupancy of the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId {
    node: Option<NodeId>,
    generation: u32,
}

impl PromiseId {
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

pub(crate) enum Repr<T: Value> {
    /// Already resolved, no node allocated
    Inline(T),
    Node {
        node: Arc<PromiseNode<T>>,
        generation: u32,
    },
}

/// The consumer side of a deferred result
#[must_use = "dropping a promise discards its result"]
pub struct Promise<T: Value> {
    repr: Option<Repr<T>>,
    // Set once a timed-out `wait_sync` has linked its notify waiter
    wakeup: Option<Arc<AtomicWaker>>,
}

/// Wakes a thread blocked in `wait_sync`
struct Unpark(Thread);

impl ArcWake for Unpark {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

impl<T: Value> Promise<T> {
    /// An already resolved promise; allocates nothing
    pub fn resolved(value: T) -> Self {
        Self {
            repr: Some(Repr::Inline(value)),
            wakeup: None,
        }
    }

    pub fn rejected(reason: impl Into<Reason>) -> Self {
        Self::settled(Outcome::Rejected(reason.into()))
    }

    pub fn canceled() -> Self {
        Self::settled(Outcome::Canceled)
    }

    /// A promise already holding `outcome`
    pub fn settled(outcome: Outcome<T>) -> Self {
        match outcome {
            Outcome::Resolved(value) => Self::resolved(value),
            failure => {
                let (deferred, promise) = Deferred::new();
                // Fresh node, the first settle always wins
                let _ = deferred.settle(failure);
                promise
            }
        }
    }

    pub(crate) fn from_node(node: Arc<PromiseNode<T>>, generation: u32) -> Self {
        Self {
            repr: Some(Repr::Node { node, generation }),
            wakeup: None,
        }
    }

    pub fn id(&self) -> PromiseId {
        match &self.repr {
            Some(Repr::Node { node, generation }) => PromiseId {
                node: Some(node.id()),
                generation: *generation,
            },
            _ => PromiseId {
                node: None,
                generation: 0,
            },
        }
    }

    /// Whether this handle may still be used
    pub fn is_valid(&self) -> bool {
        match &self.repr {
            Some(Repr::Inline(_)) => true,
            Some(Repr::Node { node, generation }) => node.is_valid(*generation),
            None => false,
        }
    }

    pub fn state(&self) -> Result<SettlementState> {
        match &self.repr {
            Some(Repr::Inline(_)) => Ok(SettlementState::Resolved),
            Some(Repr::Node { node, generation }) => node.state(*generation),
            None => Err(PromiseError::InvalidOperation(ALREADY_CONSUMED)),
        }
    }

    /// Mark the promise as shared so it can be [`duplicate`](Self::duplicate)d
    pub fn preserve(self) -> Self {
        if let Some(Repr::Node { node, .. }) = &self.repr {
            node.preserve();
        }
        self
    }

    /// Another handle to a preserved promise
    ///
    /// Each handle observes the outcome independently and must be consumed
    /// or dropped on its own.
    pub fn duplicate(&self) -> Result<Self> {
        match &self.repr {
            Some(Repr::Inline(value)) => Ok(Self::resolved(value.clone())),
            Some(Repr::Node { node, generation }) => {
                if !node.is_preserved() {
                    return Err(PromiseError::InvalidOperation(
                        "only preserved promises can be duplicated",
                    ));
                }
                node.retain(*generation)?;
                Ok(Self::from_node(node.clone(), *generation))
            }
            None => Err(PromiseError::InvalidOperation(ALREADY_CONSUMED)),
        }
    }

    /// Run `f` with this promise's outcome and settle the returned promise
    /// with its result
    ///
    /// `f` runs on the context selected by `dispatch`. A panic inside `f`
    /// rejects the returned promise. If `token` is canceled before this
    /// promise settles, the returned promise is canceled and `f` never runs.
    pub fn continue_with<U, F>(
        self,
        dispatch: Dispatch,
        token: Option<CancellationToken>,
        f: F,
    ) -> Result<Promise<U>>
    where
        U: Value,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let config = self.config();
        let target = dispatch.resolve(&config)?;
        let repr = self.into_repr()?;

        let (deferred, promise) = Deferred::<U>::new();
        let claimed = Arc::new(AtomicBool::new(false));

        if let Some(token) = token {
            let canceled = deferred.clone();
            let claimed = claimed.clone();
            let registration = token.register(move || {
                if !claimed.swap(true, Ordering::AcqRel) {
                    canceled.cancel_if_pending();
                }
            });
            deferred.unregister_on_settle(registration);
        }

        let run = move |outcome: Outcome<T>| {
            if claimed.swap(true, Ordering::AcqRel) {
                // Canceled by the token
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(move || f(outcome)))
                .unwrap_or_else(|payload| Outcome::Rejected(Reason::panicked(payload)));
            if let Err(err) = deferred.settle(result) {
                tracing::warn!(%err, "dropping continuation result");
            }
        };

        match repr {
            Repr::Inline(value) => target.run(move || run(Outcome::Resolved(value))),
            Repr::Node { node, generation } => {
                let waiter = Waiter::new(target, move |node: &Arc<PromiseNode<T>>| {
                    run(node.consume());
                });
                // Only a stale generation fails here, and a stale handle holds
                // no retain to give back.
                node.attach(generation, waiter)?;
            }
        }

        Ok(promise)
    }

    /// Attach one callback per outcome
    pub fn attach<U, R, J, C>(
        self,
        on_resolved: R,
        on_rejected: J,
        on_canceled: C,
        dispatch: Dispatch,
        token: Option<CancellationToken>,
    ) -> Result<Promise<U>>
    where
        U: Value,
        R: FnOnce(T) -> Outcome<U> + Send + 'static,
        J: FnOnce(Reason) -> Outcome<U> + Send + 'static,
        C: FnOnce() -> Outcome<U> + Send + 'static,
    {
        self.continue_with(dispatch, token, move |outcome| match outcome {
            Outcome::Resolved(value) => on_resolved(value),
            Outcome::Rejected(reason) => on_rejected(reason),
            Outcome::Canceled => on_canceled(),
        })
    }

    /// Map the resolved value inline, passing failures through
    pub fn then<U, F>(self, f: F) -> Result<Promise<U>>
    where
        U: Value,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.continue_with(Dispatch::Synchronous, None, move |outcome| outcome.map(f))
    }

    /// Block the calling thread until the promise settles
    ///
    /// Deadlocks if the producer needs this thread to make progress.
    pub fn wait(self) -> Outcome<T> {
        let mut promise = self;
        loop {
            match promise.wait_sync(None) {
                Ok(outcome) => return outcome,
                Err(pending) => promise = pending,
            }
        }
    }

    /// Block until the promise settles or `timeout` elapses
    ///
    /// On timeout the untouched promise is handed back. Waiting on it again
    /// reuses the wakeup linked by the first call.
    pub fn wait_sync(mut self, timeout: Option<Duration>) -> std::result::Result<Outcome<T>, Self> {
        let (node, generation) = match self.repr.take() {
            Some(Repr::Inline(value)) => return Ok(Outcome::Resolved(value)),
            Some(Repr::Node { node, generation }) => (node, generation),
            None => {
                return Ok(Outcome::Rejected(
                    PromiseError::InvalidOperation(ALREADY_CONSUMED).into(),
                ))
            }
        };

        if !node.is_valid(generation) {
            return Ok(Outcome::Rejected(
                PromiseError::InvalidOperation(STALE_HANDLE).into(),
            ));
        }
        if node.is_settled(generation) {
            return Ok(node.consume());
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let wakeup = match self.wakeup.take() {
            Some(wakeup) => wakeup,
            None => {
                let wakeup = Arc::new(AtomicWaker::new());
                let notify = wakeup.clone();
                let waiter =
                    Waiter::new(Target::Inline, move |_: &Arc<PromiseNode<T>>| notify.wake());
                if let Err(err) = node.attach(generation, waiter) {
                    return Ok(Outcome::Rejected(err.into()));
                }
                wakeup
            }
        };
        // Registered before the first check below, so a settle that lands
        // after it unparks this thread.
        wakeup.register(&task::waker(Arc::new(Unpark(thread::current()))));

        loop {
            if node.is_settled(generation) {
                return Ok(node.consume());
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Self {
                            repr: Some(Repr::Node { node, generation }),
                            wakeup: Some(wakeup),
                        });
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Take the handle apart for a consumer, checking it is still current
    pub(crate) fn into_repr(mut self) -> Result<Repr<T>> {
        match self.repr.take() {
            Some(Repr::Node { node, generation }) if !node.is_valid(generation) => {
                Err(PromiseError::InvalidOperation(STALE_HANDLE))
            }
            Some(repr) => Ok(repr),
            None => Err(PromiseError::InvalidOperation(ALREADY_CONSUMED)),
        }
    }

    /// Split off the value of an inline promise
    pub(crate) fn try_into_inline(mut self) -> std::result::Result<T, Self> {
        match self.repr.take() {
            Some(Repr::Inline(value)) => Ok(value),
            repr => {
                self.repr = repr;
                Err(self)
            }
        }
    }

    fn config(&self) -> Arc<Config> {
        match &self.repr {
            Some(Repr::Node { node, .. }) => node.config().clone(),
            _ => config::global().clone(),
        }
    }

    fn inline_value(&self) -> Option<&T> {
        match &self.repr {
            Some(Repr::Inline(value)) => Some(value),
            _ => None,
        }
    }
}

impl<T: Value> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(Repr::Node { node, generation }) = self.repr.take() {
            // A stale handle holds no retain
            if node.is_valid(generation) {
                node.release();
            }
        }
    }
}

impl<T: Value> std::future::IntoFuture for Promise<T> {
    type Output = Outcome<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(mut self) -> PromiseFuture<T> {
        PromiseFuture::new(self.repr.take())
    }
}

impl<T: Value + PartialEq> PartialEq for Promise<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.inline_value() == other.inline_value()
    }
}

impl<T: Value + Eq> Eq for Promise<T> {}

impl<T: Value + Hash> Hash for Promise<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
        self.inline_value().hash(state);
    }
}

impl<T: Value> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id())
            .field("state", &self.state().ok())
            .finish()
    }
}

/// The producer side of a deferred result
///
/// Cloning yields another handle able to settle the same promise. Only the
/// first settlement takes effect.
pub struct Deferred<T: Value> {
    node: Arc<PromiseNode<T>>,
    generation: u32,
}

impl<T: Value> Deferred<T> {
    /// Create a pending promise backed by the shared pool for `T`
    pub fn new() -> (Self, Promise<T>) {
        Self::new_in(&NodePool::shared())
    }

    /// Create a pending promise backed by `pool`
    pub fn new_in(pool: &Arc<NodePool<T>>) -> (Self, Promise<T>) {
        let (node, generation) = pool.rent();
        let deferred = Self {
            node: node.clone(),
            generation,
        };
        (deferred, Promise::from_node(node, generation))
    }

    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(Outcome::Resolved(value))
    }

    pub fn reject(&self, reason: impl Into<Reason>) -> Result<()> {
        self.settle(Outcome::Rejected(reason.into()))
    }

    pub fn cancel(&self) -> Result<()> {
        self.settle(Outcome::Canceled)
    }

    /// Settle the promise with `outcome`
    ///
    /// Fails with [`PromiseError::DoubleSettle`] if the promise already
    /// settled, or [`PromiseError::InvalidOperation`] if its node has since
    /// been recycled.
    pub fn settle(&self, outcome: Outcome<T>) -> Result<()> {
        self.node.settle(self.generation, outcome)
    }

    /// Cancel the promise when `token` is canceled, unless it settled first
    ///
    /// The callback is removed from the token once the promise settles.
    pub fn cancel_on(&self, token: &CancellationToken) {
        let deferred = self.clone();
        let registration = token.register(move || {
            deferred.cancel_if_pending();
        });
        self.unregister_on_settle(registration);
    }

    /// Cancel unless another settlement got there first
    pub(crate) fn cancel_if_pending(&self) -> bool {
        self.node
            .try_settle(self.generation, Outcome::Canceled)
            .is_ok()
    }

    pub(crate) fn unregister_on_settle(&self, registration: Registration) {
        self.node.bind_registration(self.generation, registration);
    }

    pub fn is_valid(&self) -> bool {
        self.node.is_valid(self.generation)
    }

    /// Whether the promise is still open to settlement
    ///
    /// A settlement already in progress on another thread counts as settled.
    pub fn is_pending(&self) -> bool {
        self.node.is_pending(self.generation)
    }

    pub fn id(&self) -> PromiseId {
        PromiseId {
            node: Some(self.node.id()),
            generation: self.generation,
        }
    }
}

impl<T: Value> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            generation: self.generation,
        }
    }
}

impl<T: Value> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id())
            .field("pending", &self.is_pending())
            .finish()
    }
}
