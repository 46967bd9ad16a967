//! Settlement nodes
//!
//! A [`PromiseNode`] backs every pending promise. Its lifecycle state and
//! its generation live in one atomic word, so "is this handle still the
//! current occupant" and "is it still pending" are answered by a single
//! compare-and-swap:
//!
//! ```text
//!  63                     8 7        0
//! +------------------------+----------+
//! |       generation       |  status  |
//! +------------------------+----------+
//! ```
//!
//! Settlement goes `PENDING -> SETTLING -> terminal`. The `SETTLING` step
//! reserves the node for one producer while the payload is written; readers
//! treat it as still pending.
//!
//! A node is retained by its consumer handle and by the pending producer.
//! The producer's retain is dropped at the end of settlement and the
//! consumer's once the result has been read. The last release reports an
//! unobserved rejection, bumps the generation and hands the node back to its
//! pool.
//!
//! Cancellation callbacks that would cancel a node are bound to it with
//! [`bind_registration`](PromiseNode::bind_registration) and unregistered
//! when it settles.

use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam_queue::SegQueue;

use crate::cancellation::Registration;
use crate::config::{Config, UncaughtRejection};
use crate::continuation::{Waiter, Waiters};
use crate::error::{PromiseError, Result};
use crate::pool::{NodeId, NodePool};
use crate::state::{Outcome, SettlementState};
use crate::Value;

const STATUS_BITS: u32 = 8;
const STATUS_MASK: u64 = (1 << STATUS_BITS) - 1;

const PENDING: u8 = SettlementState::Pending as u8;
const SETTLING: u8 = 1;

/// Retains held by a freshly rented node: the consumer and the producer
pub(crate) const INITIAL_RETAINS: u32 = 2;

pub(crate) const STALE_HANDLE: &str = "promise handle refers to a recycled node";
pub(crate) const ALREADY_CONSUMED: &str = "promise result already consumed";

#[inline]
fn pack(generation: u32, status: u8) -> u64 {
    (u64::from(generation) << STATUS_BITS) | u64::from(status)
}

#[inline]
fn unpack(word: u64) -> (u32, u8) {
    ((word >> STATUS_BITS) as u32, (word & STATUS_MASK) as u8)
}

#[inline]
fn is_terminal(status: u8) -> bool {
    status > SETTLING
}

/// The shared settlement record behind a pending promise
pub struct PromiseNode<T: Value> {
    id: NodeId,
    state: AtomicU64,
    payload: Mutex<Option<Outcome<T>>>,
    waiters: Waiters<T>,
    registrations: SegQueue<Registration>,
    retains: AtomicU32,
    preserved: AtomicBool,
    observed: AtomicBool,
    pool: Weak<NodePool<T>>,
    config: Arc<Config>,
}

impl<T: Value> PromiseNode<T> {
    pub(crate) fn new(id: NodeId, pool: Weak<NodePool<T>>, config: Arc<Config>) -> Self {
        Self {
            id,
            state: AtomicU64::new(pack(0, PENDING)),
            payload: Mutex::new(None),
            waiters: Waiters::new(),
            registrations: SegQueue::new(),
            retains: AtomicU32::new(INITIAL_RETAINS),
            preserved: AtomicBool::new(false),
            observed: AtomicBool::new(false),
            pool,
            config,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The generation of the node's current occupant
    pub fn generation(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Whether a handle carrying `generation` still refers to this node
    pub fn is_valid(&self, generation: u32) -> bool {
        self.generation() == generation
    }

    /// The state seen by a handle carrying `generation`
    pub fn state(&self, generation: u32) -> Result<SettlementState> {
        let (current, status) = unpack(self.state.load(Ordering::Acquire));
        if current != generation {
            return Err(PromiseError::InvalidOperation(STALE_HANDLE));
        }
        Ok(SettlementState::from_bits(status).unwrap_or(SettlementState::Pending))
    }

    pub(crate) fn is_settled(&self, generation: u32) -> bool {
        let (current, status) = unpack(self.state.load(Ordering::Acquire));
        current == generation && is_terminal(status)
    }

    /// Still open to settlement; a settle in progress counts as taken
    pub(crate) fn is_pending(&self, generation: u32) -> bool {
        self.state.load(Ordering::Acquire) == pack(generation, PENDING)
    }

    /// Move the node to a terminal state and run its waiters
    ///
    /// Exactly one call per generation succeeds. A losing call for the same
    /// generation gets [`PromiseError::DoubleSettle`]; a call from a previous
    /// generation gets [`PromiseError::InvalidOperation`].
    pub(crate) fn settle(self: &Arc<Self>, generation: u32, outcome: Outcome<T>) -> Result<()> {
        let result = self.try_settle(generation, outcome);
        if matches!(result, Err(PromiseError::DoubleSettle)) {
            tracing::warn!(node = ?self.id, generation, "promise settled more than once");
        }
        result
    }

    /// [`settle`](Self::settle) for callers that expect to lose races
    pub(crate) fn try_settle(self: &Arc<Self>, generation: u32, outcome: Outcome<T>) -> Result<()> {
        if let Err(actual) = self.state.compare_exchange(
            pack(generation, PENDING),
            pack(generation, SETTLING),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            let (current, _) = unpack(actual);
            if current != generation {
                return Err(PromiseError::InvalidOperation(STALE_HANDLE));
            }
            return Err(PromiseError::DoubleSettle);
        }

        let status = outcome.state() as u8;
        *self.lock_payload() = Some(outcome);
        self.state.store(pack(generation, status), Ordering::Release);
        // Pairs with the fences in `attach` and `bind_registration`: either
        // the other side sees the terminal state or the drains below see
        // what it linked.
        fence(Ordering::SeqCst);

        tracing::trace!(node = ?self.id, generation, status, "promise settled");
        self.unregister_all();
        self.waiters.drain(|waiter| waiter.dispatch(self));

        // Drop the producer's retain
        self.release();
        Ok(())
    }

    /// Link a waiter, or dispatch it right away if already settled
    ///
    /// The waiter is dispatched exactly once. The caller must hold a retain
    /// of `generation` for the duration of the call, either directly or
    /// inside `waiter`.
    pub(crate) fn attach(self: &Arc<Self>, generation: u32, waiter: Waiter<T>) -> Result<()> {
        let (current, status) = unpack(self.state.load(Ordering::Acquire));
        if current != generation {
            return Err(PromiseError::InvalidOperation(STALE_HANDLE));
        }
        if is_terminal(status) {
            waiter.dispatch(self);
            return Ok(());
        }

        // Once linked, the waiter may be consumed by the settler and its
        // retain dropped. Hold our own so the node cannot be recycled and
        // re-rented before the late drain below.
        self.retains.fetch_add(1, Ordering::AcqRel);
        self.waiters.push(waiter);
        fence(Ordering::SeqCst);
        let (_, status) = unpack(self.state.load(Ordering::SeqCst));
        if is_terminal(status) {
            // Settled between the check and the push; the settler may have
            // drained before our waiter landed.
            self.waiters.drain(|waiter| waiter.dispatch(self));
        }
        self.release();
        Ok(())
    }

    /// Unregister `registration` once this occupancy settles
    ///
    /// If the node has already settled, or `generation` is stale, the
    /// registration is unregistered right away.
    pub(crate) fn bind_registration(&self, generation: u32, registration: Registration) {
        self.registrations.push(registration.clone());
        fence(Ordering::SeqCst);
        let (current, status) = unpack(self.state.load(Ordering::SeqCst));
        if current != generation || is_terminal(status) {
            // Only our own: anything else queued may belong to a later
            // occupancy.
            registration.unregister();
        }
    }

    fn unregister_all(&self) {
        while let Some(registration) = self.registrations.pop() {
            registration.unregister();
        }
    }

    /// Read the settled outcome
    ///
    /// Preserved nodes hand out a clone per reader. Otherwise the outcome is
    /// moved out and a second read fails.
    pub(crate) fn read_outcome(&self) -> Result<Outcome<T>> {
        self.observed.store(true, Ordering::Release);
        let mut payload = self.lock_payload();
        let outcome = if self.preserved.load(Ordering::Acquire) {
            payload.clone()
        } else {
            payload.take()
        };
        outcome.ok_or(PromiseError::InvalidOperation(ALREADY_CONSUMED))
    }

    /// Read the outcome and drop the reader's retain
    pub(crate) fn consume(self: &Arc<Self>) -> Outcome<T> {
        let outcome = self.read_outcome();
        self.release();
        outcome.unwrap_or_else(|err| Outcome::Rejected(err.into()))
    }

    /// Allow the result to be read by more than one consumer
    pub(crate) fn preserve(&self) {
        self.preserved.store(true, Ordering::Release);
        self.waiters.install_fan_out();
    }

    pub(crate) fn is_preserved(&self) -> bool {
        self.preserved.load(Ordering::Acquire)
    }

    /// Add a retain for another consumer handle
    pub(crate) fn retain(&self, generation: u32) -> Result<()> {
        if !self.is_valid(generation) {
            return Err(PromiseError::InvalidOperation(STALE_HANDLE));
        }
        self.retains
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_add(1)
            })
            .map(|_| ())
            .map_err(|_| PromiseError::Overflow)
    }

    /// Drop one retain, recycling the node when it was the last
    pub(crate) fn release(self: &Arc<Self>) {
        let previous = self.retains.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "promise node released more often than retained");
        if previous == 1 {
            self.recycle();
        }
    }

    /// No waiters linked
    pub(crate) fn is_idle(&self) -> bool {
        self.waiters.is_empty()
    }

    fn recycle(self: &Arc<Self>) {
        let (generation, status) = unpack(self.state.load(Ordering::Acquire));

        let unobserved = match self.lock_payload().take() {
            Some(Outcome::Rejected(reason)) if !self.observed.load(Ordering::Acquire) => {
                Some(reason)
            }
            _ => None,
        };
        if let Some(reason) = unobserved {
            self.config.report_uncaught(UncaughtRejection {
                node: self.id,
                reason,
            });
        }

        debug_assert!(is_terminal(status), "recycling a node that never settled");
        debug_assert!(self.waiters.is_empty(), "recycling a node with linked waiters");
        self.unregister_all();

        self.observed.store(false, Ordering::Relaxed);
        self.preserved.store(false, Ordering::Relaxed);
        self.retains.store(INITIAL_RETAINS, Ordering::Relaxed);
        let next = generation.wrapping_add(1);
        self.state.store(pack(next, PENDING), Ordering::Release);
        tracing::trace!(node = ?self.id, generation = next, "promise node recycled");

        if !self.config.pooling() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(self.clone());
        }
    }

    fn lock_payload(&self) -> MutexGuard<'_, Option<Outcome<T>>> {
        self.payload.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn linked_waiters(&self) -> usize {
        self.waiters.len()
    }
}

impl<T: Value> fmt::Debug for PromiseNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (generation, status) = unpack(self.state.load(Ordering::Acquire));
        f.debug_struct("PromiseNode")
            .field("id", &self.id)
            .field("generation", &generation)
            .field("status", &status)
            .field("retains", &self.retains.load(Ordering::Relaxed))
            .finish()
    }
}
