//! `Future` adapter for promises
//!
//! Awaiting a [`Promise`](crate::Promise) turns it into a [`PromiseFuture`].
//! The first pending poll links a waiter that wakes whichever task polled
//! last; the outcome is read straight from the node once it settles.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::continuation::Waiter;
use crate::dispatch::Target;
use crate::node::PromiseNode;
use crate::promise::Repr;
use crate::state::Outcome;
use crate::Value;

/// A future resolving to the outcome of a promise
pub struct PromiseFuture<T: Value> {
    repr: Option<Repr<T>>,
    waker: Arc<AtomicWaker>,
    linked: bool,
}

impl<T: Value> PromiseFuture<T> {
    pub(crate) fn new(repr: Option<Repr<T>>) -> Self {
        Self {
            repr,
            waker: Arc::new(AtomicWaker::new()),
            linked: false,
        }
    }

    /// Check if the outcome is available without polling
    pub fn is_ready(&self) -> bool {
        match &self.repr {
            Some(Repr::Inline(_)) => true,
            Some(Repr::Node { node, generation }) => node.is_settled(*generation),
            None => false,
        }
    }
}

// No field is structurally pinned
impl<T: Value> Unpin for PromiseFuture<T> {}

impl<T: Value> std::future::Future for PromiseFuture<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (node, generation) = match this.repr.take() {
            Some(Repr::Inline(value)) => return Poll::Ready(Outcome::Resolved(value)),
            Some(Repr::Node { node, generation }) => (node, generation),
            None => panic!("PromiseFuture polled after completion"),
        };

        if node.is_settled(generation) {
            return Poll::Ready(node.consume());
        }

        this.waker.register(cx.waker());
        if !this.linked {
            this.linked = true;
            let waker = this.waker.clone();
            let notify = Waiter::new(Target::Inline, move |_: &Arc<PromiseNode<T>>| waker.wake());
            if let Err(err) = node.attach(generation, notify) {
                return Poll::Ready(Outcome::Rejected(err.into()));
            }
        }

        // Settled while the waker was being registered
        if node.is_settled(generation) {
            return Poll::Ready(node.consume());
        }

        this.repr = Some(Repr::Node { node, generation });
        Poll::Pending
    }
}

impl<T: Value> Drop for PromiseFuture<T> {
    fn drop(&mut self) {
        if let Some(Repr::Node { node, generation }) = self.repr.take() {
            if node.is_valid(generation) {
                node.release();
            }
        }
    }
}
