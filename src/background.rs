//! Background dispatch context
//!
//! A fixed set of worker threads fed by one unbounded channel. Any worker
//! may pick up any job, so jobs posted here run in parallel and in no
//! particular order relative to each other.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;

use crate::config::BACKGROUND_THREAD_NAME_PREFIX;
use crate::dispatch::{DispatchContext, Job};
use crate::error::{PromiseError, Result};
use crate::state::Reason;

/// Messages consumed by worker threads
pub enum WorkerMessage {
    /// Run a posted job
    Run(Job),
    /// Stop the receiving worker
    Shutdown,
}

impl fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMessage::Run(_) => f.debug_tuple("Run").field(&"<Job>").finish(),
            WorkerMessage::Shutdown => f.debug_struct("Shutdown").finish(),
        }
    }
}

/// A thread pool that runs posted continuations
pub struct BackgroundPool {
    sender: Sender<WorkerMessage>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl BackgroundPool {
    /// Start a pool with `num_workers` threads
    pub fn new(num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(PromiseError::InvalidArgument(
                "Cannot create background pool with 0 workers".to_string(),
            ));
        }

        let (sender, receiver) = unbounded();
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", BACKGROUND_THREAD_NAME_PREFIX, worker_id))
                .spawn(move || run_worker(worker_id, receiver))
                .map_err(|e| {
                    PromiseError::InvalidArgument(format!("Failed to spawn worker thread: {}", e))
                })?;
            workers.push(handle);
        }

        tracing::debug!("Started background pool with {} workers", num_workers);

        Ok(Self {
            sender,
            workers: Mutex::new(workers),
            num_workers,
        })
    }

    /// The process-wide pool, started on first use with one worker per CPU
    pub fn shared() -> Arc<BackgroundPool> {
        SHARED_POOL.clone()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Stop all workers after they drain the jobs queued ahead of the signal
    pub fn shutdown(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }

        for _ in 0..workers.len() {
            let _ = self.sender.send(WorkerMessage::Shutdown);
        }

        for (worker_id, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                tracing::error!("Failed to join background worker {}", worker_id);
            }
        }

        tracing::debug!("Background pool shut down");
    }

    fn is_running(&self) -> bool {
        !self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl DispatchContext for BackgroundPool {
    fn post(&self, job: Job) {
        if !self.is_running() {
            tracing::warn!("Background pool is shut down, running job inline");
            job();
            return;
        }
        if let Err(err) = self.sender.send(WorkerMessage::Run(job)) {
            tracing::warn!("Background pool disconnected, running job inline");
            if let WorkerMessage::Run(job) = err.into_inner() {
                job();
            }
        }
    }
}

impl fmt::Debug for BackgroundPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundPool")
            .field("num_workers", &self.num_workers)
            .finish()
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main loop for one worker thread
fn run_worker(worker_id: usize, receiver: Receiver<WorkerMessage>) {
    tracing::trace!("Background worker {} started", worker_id);

    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Run(job) => {
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    let reason = Reason::panicked(payload);
                    tracing::error!(worker_id, %reason, "background job panicked");
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }

    tracing::trace!("Background worker {} stopped", worker_id);
}

static SHARED_POOL: Lazy<Arc<BackgroundPool>> = Lazy::new(|| {
    let workers = num_cpus::get().max(1);
    match BackgroundPool::new(workers) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::warn!("Falling back to a single background worker: {}", e);
            Arc::new(BackgroundPool::new(1).unwrap_or_else(|_| BackgroundPool::detached()))
        }
    }
});

impl BackgroundPool {
    /// A pool with no workers; every post runs inline
    fn detached() -> Self {
        let (sender, _) = unbounded();
        Self {
            sender,
            workers: Mutex::new(Vec::new()),
            num_workers: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            BackgroundPool::new(0),
            Err(PromiseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_jobs_run_off_thread() {
        let pool = BackgroundPool::new(2).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let caller = thread::current().id();

        pool.post(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send((thread::current().id(), name)).unwrap();
        }));

        let (worker, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, caller);
        assert!(name.unwrap().starts_with(BACKGROUND_THREAD_NAME_PREFIX));
    }

    #[test]
    fn test_shutdown_drains_queued_jobs() {
        let pool = BackgroundPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_post_after_shutdown_runs_inline() {
        let pool = BackgroundPool::new(1).unwrap();
        pool.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.post(Box::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = BackgroundPool::new(1).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);

        pool.post(Box::new(|| panic!("worker job panicked")));
        pool.post(Box::new(move || tx.send(()).unwrap()));

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
