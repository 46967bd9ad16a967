//! Continuation linking
//!
//! A pending node stores its waiters in [`Waiters`]: a single slot that
//! covers the common case of a promise awaited exactly once, plus a fan-out
//! queue that is only allocated when a second waiter arrives (or when the
//! promise is preserved for sharing).
//!
//! Neither shape takes a lock. Linking and draining are single atomic
//! operations per waiter, so a waiter is handed out to exactly one drainer.
//! Whether a late attacher or the settling thread does the draining is
//! decided by the fence protocol in [`PromiseNode`](crate::PromiseNode).

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;

use crate::dispatch::Target;
use crate::node::PromiseNode;
use crate::Value;

type Resume<T> = Box<dyn FnOnce(&Arc<PromiseNode<T>>) + Send + 'static>;

/// A continuation waiting for a node to settle
pub struct Waiter<T: Value> {
    target: Target,
    resume: Resume<T>,
}

impl<T: Value> Waiter<T> {
    pub(crate) fn new<F>(target: Target, resume: F) -> Self
    where
        F: FnOnce(&Arc<PromiseNode<T>>) + Send + 'static,
    {
        Self {
            target,
            resume: Box::new(resume),
        }
    }

    /// Hand the continuation to its dispatch target
    pub(crate) fn dispatch(self, node: &Arc<PromiseNode<T>>) {
        let node = node.clone();
        let resume = self.resume;
        self.target.run(move || resume(&node));
    }
}

/// Waiter storage for one node
pub(crate) struct Waiters<T: Value> {
    single: AtomicPtr<Waiter<T>>,
    fan_out: OnceCell<SegQueue<Waiter<T>>>,
}

impl<T: Value> Waiters<T> {
    pub(crate) fn new() -> Self {
        Self {
            single: AtomicPtr::new(ptr::null_mut()),
            fan_out: OnceCell::new(),
        }
    }

    /// Link a waiter, upgrading to fan-out when the single slot is taken
    pub(crate) fn push(&self, waiter: Waiter<T>) {
        if let Some(queue) = self.fan_out.get() {
            queue.push(waiter);
            return;
        }

        let raw = Box::into_raw(Box::new(waiter));
        if self
            .single
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: the exchange failed, so `raw` was never published and
            // this thread still owns the allocation.
            let waiter = unsafe { Box::from_raw(raw) };
            self.fan_out.get_or_init(SegQueue::new).push(*waiter);
        }
    }

    /// Allocate the fan-out queue ahead of time
    pub(crate) fn install_fan_out(&self) {
        self.fan_out.get_or_init(SegQueue::new);
    }

    /// Remove every linked waiter, single slot first
    pub(crate) fn drain<F>(&self, mut f: F)
    where
        F: FnMut(Waiter<T>),
    {
        let raw = self.single.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: `raw` came from `Box::into_raw` in `push`, and the swap
            // above transferred sole ownership of it to this thread.
            let waiter = unsafe { Box::from_raw(raw) };
            f(*waiter);
        }

        if let Some(queue) = self.fan_out.get() {
            while let Some(waiter) = queue.pop() {
                f(waiter);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.single.load(Ordering::Acquire).is_null()
            && self.fan_out.get().map_or(true, SegQueue::is_empty)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let single = usize::from(!self.single.load(Ordering::Acquire).is_null());
        single + self.fan_out.get().map_or(0, SegQueue::len)
    }
}

impl<T: Value> Drop for Waiters<T> {
    fn drop(&mut self) {
        self.drain(drop);
    }
}
