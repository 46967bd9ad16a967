//! Shared combinator machinery
//!
//! Every combinator is an [`Engine`] around a collector. Children are wired
//! in three steps:
//!
//! 1. [`enumerate`] walks the children once. Inline values are set aside,
//!    pending children become [`PassThrough`]s in a local queue. Nothing is
//!    linked yet.
//! 2. The caller sizes its collector for exactly the number of children seen.
//! 3. [`run`] builds the engine, writes the inline values and only then links
//!    the queued pass-throughs. From here on children may settle on any
//!    thread, and every slot they can write to already exists.
//!
//! The engine settles its parent exactly once: either a collector write
//! finishes early, or the child whose decrement brings `remaining` to zero
//! asks the collector for the final outcome.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;

use crate::cancellation::CancellationToken;
use crate::continuation::Waiter;
use crate::dispatch::Target;
use crate::error::{PromiseError, Result};
use crate::node::PromiseNode;
use crate::promise::{Deferred, Promise, Repr};
use crate::state::Outcome;
use crate::Value;

/// What a child's completion did to the combinator
pub(crate) enum Step<O> {
    /// Keep waiting for the remaining children
    Continue,
    /// Settle the parent now
    Finish(Outcome<O>),
}

/// Per-combinator result container
pub(crate) trait Collect: Send + Sync + 'static {
    type Output: Value;

    /// The parent's outcome once every child has settled without finishing
    fn complete(&self) -> Outcome<Self::Output>;
}

/// Writes one child's outcome into its slot
pub(crate) type Writer<T, C> = fn(&C, usize, Outcome<T>) -> Step<<C as Collect>::Output>;

pub(crate) struct Engine<C: Collect> {
    collector: C,
    remaining: CachePadded<AtomicU32>,
    finalized: AtomicBool,
    parent: Deferred<C::Output>,
}

impl<C: Collect> Engine<C> {
    pub(crate) fn new(collector: C, pending: u32, parent: Deferred<C::Output>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            remaining: CachePadded::new(AtomicU32::new(pending)),
            finalized: AtomicBool::new(false),
            parent,
        })
    }

    pub(crate) fn collector(&self) -> &C {
        &self.collector
    }

    /// Apply a write that did not come from a pending child
    pub(crate) fn apply(&self, step: Step<C::Output>) {
        if let Step::Finish(outcome) = step {
            self.finalize(outcome);
        }
    }

    /// Settle the parent from the collector unless something finished first
    pub(crate) fn complete(&self) {
        if !self.finalized.load(Ordering::Acquire) {
            let outcome = self.collector.complete();
            self.finalize(outcome);
        }
    }

    /// Record one pending child's completion
    fn child_settled(&self, step: Step<C::Output>) {
        self.apply(step);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete();
        }
    }

    fn finalize(&self, outcome: Outcome<C::Output>) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.parent.settle(outcome) {
            tracing::warn!(%err, "combinator parent already settled");
        }
    }

    /// Cancel the parent when `token` fires; children keep running
    ///
    /// The callback is unregistered once the parent settles either way.
    pub(crate) fn cancel_on(self: &Arc<Self>, token: &CancellationToken) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let registration = token.register(move || {
            if let Some(engine) = engine.upgrade() {
                tracing::debug!("combinator canceled by token");
                engine.finalize(Outcome::Canceled);
            }
        });
        self.parent.unregister_on_settle(registration);
    }

    /// Link a pending child to `index`
    pub(crate) fn link<T: Value>(self: &Arc<Self>, child: Promise<T>, index: usize, write: Writer<T, C>) {
        PassThrough {
            child,
            index,
            write,
        }
        .install(self);
    }
}

/// Carries one child's completion into its slot of the parent's container
pub(crate) struct PassThrough<T: Value, C: Collect> {
    child: Promise<T>,
    index: usize,
    write: Writer<T, C>,
}

impl<T: Value, C: Collect> PassThrough<T, C> {
    /// Link into the child's waiter list; the child's settlement path owns
    /// notifying the engine from here on
    pub(crate) fn install(self, engine: &Arc<Engine<C>>) {
        let PassThrough {
            child,
            index,
            write,
        } = self;

        match child.into_repr() {
            Ok(Repr::Node { node, generation }) => {
                let target = engine.clone();
                let waiter = Waiter::new(Target::Inline, move |node: &Arc<PromiseNode<T>>| {
                    let outcome = node.consume();
                    target.child_settled(write(target.collector(), index, outcome));
                });
                if let Err(err) = node.attach(generation, waiter) {
                    tracing::error!(%err, index, "failed to link combinator child");
                    engine.child_settled(Step::Finish(Outcome::Rejected(err.into())));
                }
            }
            Ok(Repr::Inline(value)) => {
                engine.child_settled(write(engine.collector(), index, Outcome::Resolved(value)));
            }
            Err(err) => engine.child_settled(Step::Finish(Outcome::Rejected(err.into()))),
        }
    }
}

/// Children split by whether they still need linking
pub(crate) struct Enumerated<T: Value, C: Collect> {
    len: usize,
    inline: Vec<(usize, T)>,
    queue: Vec<PassThrough<T, C>>,
    write: Writer<T, C>,
}

impl<T: Value, C: Collect> Enumerated<T, C> {
    /// Total number of children, inline and pending
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Count one more pending child, refusing to wrap
pub(crate) fn count_child(pending: u32) -> Result<u32> {
    pending.checked_add(1).ok_or(PromiseError::Overflow)
}

/// First pass over the children
///
/// Every child is validated before anything is linked, so an invalid child
/// leaves no partial wiring behind.
pub(crate) fn enumerate<T, C, I>(children: I, write: Writer<T, C>) -> Result<Enumerated<T, C>>
where
    T: Value,
    C: Collect,
    I: IntoIterator<Item = Promise<T>>,
{
    let mut inline = Vec::new();
    let mut queue = Vec::new();
    let mut pending: u32 = 0;
    let mut len = 0;

    for (index, child) in children.into_iter().enumerate() {
        if !child.is_valid() {
            return Err(PromiseError::InvalidArgument(format!(
                "child {} is not a valid promise",
                index
            )));
        }
        match child.try_into_inline() {
            Ok(value) => inline.push((index, value)),
            Err(child) => {
                pending = count_child(pending)?;
                queue.push(PassThrough {
                    child,
                    index,
                    write,
                });
            }
        }
        len = index + 1;
    }

    Ok(Enumerated {
        len,
        inline,
        queue,
        write,
    })
}

/// Build the engine over enumerated children and link them
pub(crate) fn run<T, C>(
    enumerated: Enumerated<T, C>,
    collector: C,
    token: Option<&CancellationToken>,
) -> Promise<C::Output>
where
    T: Value,
    C: Collect,
{
    let Enumerated {
        len,
        inline,
        queue,
        write,
    } = enumerated;
    let (parent, promise) = Deferred::new();
    // `enumerate` counted these with overflow checks
    let engine = Engine::new(collector, queue.len() as u32, parent);

    if let Some(token) = token {
        engine.cancel_on(token);
    }

    for (index, value) in inline {
        engine.apply(write(engine.collector(), index, Outcome::Resolved(value)));
    }
    if queue.is_empty() {
        engine.complete();
    }

    tracing::trace!(children = len, pending = queue.len(), "linking combinator");
    for pass in queue {
        pass.install(&engine);
    }

    promise
}
