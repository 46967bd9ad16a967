//! Result containers for the homogeneous combinators
//!
//! Slots are written at most once and never locked: each pending child owns
//! exactly one index, and the collector is only read after the last child's
//! decrement.

use std::marker::PhantomData;
use std::mem;
use std::sync::{Mutex, PoisonError};

use once_cell::sync::OnceCell;

use super::engine::{Collect, Step};
use crate::error::PromiseError;
use crate::state::Outcome;
use crate::Value;

fn empty_slot<O>() -> Outcome<O> {
    Outcome::Rejected(PromiseError::InvalidOperation("combinator slot never written").into())
}

fn slots<S>(len: usize) -> Vec<OnceCell<S>> {
    (0..len).map(|_| OnceCell::new()).collect()
}

/// Fail-fast: every value, or the first failure
pub(crate) struct AllValues<T> {
    slots: Vec<OnceCell<T>>,
    output: Mutex<Vec<T>>,
}

impl<T: Value> AllValues<T> {
    /// `output` is cleared and reused for the final vector
    pub(crate) fn new(len: usize, mut output: Vec<T>) -> Self {
        output.clear();
        output.reserve_exact(len);
        Self {
            slots: slots(len),
            output: Mutex::new(output),
        }
    }

    pub(crate) fn write(&self, index: usize, outcome: Outcome<T>) -> Step<Vec<T>> {
        match outcome.into_failure() {
            Err(value) => {
                if let Some(slot) = self.slots.get(index) {
                    let _ = slot.set(value);
                }
                Step::Continue
            }
            Ok(failure) => Step::Finish(failure),
        }
    }
}

impl<T: Value> Collect for AllValues<T> {
    type Output = Vec<T>;

    fn complete(&self) -> Outcome<Vec<T>> {
        let mut output = mem::take(&mut *self.output.lock().unwrap_or_else(PoisonError::into_inner));
        for slot in &self.slots {
            match slot.get() {
                Some(value) => output.push(value.clone()),
                None => return empty_slot(),
            }
        }
        Outcome::Resolved(output)
    }
}

/// Wait-all: every child's outcome, failures included
pub(crate) struct AllOutcomes<T> {
    slots: Vec<OnceCell<Outcome<T>>>,
    output: Mutex<Vec<Outcome<T>>>,
}

impl<T: Value> AllOutcomes<T> {
    pub(crate) fn new(len: usize, mut output: Vec<Outcome<T>>) -> Self {
        output.clear();
        output.reserve_exact(len);
        Self {
            slots: slots(len),
            output: Mutex::new(output),
        }
    }

    pub(crate) fn write(&self, index: usize, outcome: Outcome<T>) -> Step<Vec<Outcome<T>>> {
        if let Some(slot) = self.slots.get(index) {
            let _ = slot.set(outcome);
        }
        Step::Continue
    }
}

impl<T: Value> Collect for AllOutcomes<T> {
    type Output = Vec<Outcome<T>>;

    fn complete(&self) -> Outcome<Vec<Outcome<T>>> {
        let mut output = mem::take(&mut *self.output.lock().unwrap_or_else(PoisonError::into_inner));
        for slot in &self.slots {
            output.push(slot.get().cloned().unwrap_or_else(empty_slot));
        }
        Outcome::Resolved(output)
    }
}

/// Race: the first outcome of any kind
pub(crate) struct FirstSettled<T> {
    _value: PhantomData<fn() -> T>,
}

impl<T: Value> FirstSettled<T> {
    pub(crate) fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }

    pub(crate) fn write(&self, _index: usize, outcome: Outcome<T>) -> Step<T> {
        Step::Finish(outcome)
    }
}

impl<T: Value> Collect for FirstSettled<T> {
    type Output = T;

    // Unreachable with at least one child: the first write finishes
    fn complete(&self) -> Outcome<T> {
        empty_slot()
    }
}

/// Race reporting the winner's position
pub(crate) struct FirstSettledIndexed<T> {
    _value: PhantomData<fn() -> T>,
}

impl<T: Value> FirstSettledIndexed<T> {
    pub(crate) fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }

    pub(crate) fn write(&self, index: usize, outcome: Outcome<T>) -> Step<(usize, T)> {
        Step::Finish(outcome.map(|value| (index, value)))
    }
}

impl<T: Value> Collect for FirstSettledIndexed<T> {
    type Output = (usize, T);

    fn complete(&self) -> Outcome<(usize, T)> {
        empty_slot()
    }
}

/// First resolved value; if nothing resolves, the first failure
pub(crate) struct FirstResolved<T> {
    first_failure: OnceCell<Outcome<T>>,
}

impl<T: Value> FirstResolved<T> {
    pub(crate) fn new() -> Self {
        Self {
            first_failure: OnceCell::new(),
        }
    }

    pub(crate) fn write(&self, _index: usize, outcome: Outcome<T>) -> Step<T> {
        match outcome {
            Outcome::Resolved(value) => Step::Finish(Outcome::Resolved(value)),
            failure => {
                let _ = self.first_failure.set(failure);
                Step::Continue
            }
        }
    }
}

impl<T: Value> Collect for FirstResolved<T> {
    type Output = T;

    fn complete(&self) -> Outcome<T> {
        self.first_failure.get().cloned().unwrap_or_else(empty_slot)
    }
}
