//! Foreground dispatch context with panic isolation
//!
//! A [`ForegroundContext`] is a job queue owned by one thread (typically the
//! application's main loop). Any thread may post continuations to it; only
//! the owner runs them, by calling [`tick`](ForegroundContext::tick) or one
//! of the `run_*` helpers.
//!
//! ## Panic Handling
//!
//! Every job is wrapped with `std::panic::catch_unwind`. When a job panics:
//!
//! 1. The panic is caught and logged
//! 2. The job is considered finished
//! 3. Remaining jobs continue to run normally
//!
//! Continuations created by this crate already convert their own panics into
//! rejections, so this only ever catches panics from raw posted jobs.

use std::sync::{Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::config::FOREGROUND_TICK_BUDGET;
use crate::dispatch::{DispatchContext, Job};

/// A dispatch context drained explicitly by its owning thread
pub struct ForegroundContext {
    ready_queue: SegQueue<Job>,
    owner: Mutex<Option<Thread>>,
}

impl ForegroundContext {
    /// Create a new context owned by the current thread
    pub fn new() -> Self {
        Self {
            ready_queue: SegQueue::new(),
            owner: Mutex::new(Some(thread::current())),
        }
    }

    /// Make the current thread the one woken when jobs arrive
    pub fn claim(&self) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current());
    }

    /// Run ready jobs once, up to [`FOREGROUND_TICK_BUDGET`]
    ///
    /// Returns the number of jobs that ran.
    pub fn tick(&self) -> usize {
        let mut executed = 0;

        while executed < FOREGROUND_TICK_BUDGET {
            let Some(job) = self.ready_queue.pop() else {
                break;
            };

            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                let reason = crate::state::Reason::panicked(payload);
                tracing::error!(%reason, "foreground job panicked");
            }
            executed += 1;
        }

        executed
    }

    /// Run jobs until the queue is empty, including jobs posted meanwhile
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let executed = self.tick();
            if executed == 0 {
                return total;
            }
            total += executed;
        }
    }

    /// Run jobs until `done` returns true or `timeout` elapses
    ///
    /// Returns whether `done` was observed. The calling thread parks between
    /// ticks and is woken by [`post`](DispatchContext::post).
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        self.claim();
        let deadline = Instant::now() + timeout;

        loop {
            self.run_until_idle();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // No progress made; park until posted to or the deadline passes
            thread::park_timeout(deadline - now);
        }
    }

    /// Get the number of queued jobs
    pub fn pending(&self) -> usize {
        self.ready_queue.len()
    }
}

impl Default for ForegroundContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchContext for ForegroundContext {
    fn post(&self, job: Job) {
        self.ready_queue.push(job);
        if let Some(owner) = self
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            owner.unpark();
        }
    }
}
