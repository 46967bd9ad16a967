//! Where continuation bodies run
//!
//! Settlement can happen on any producer thread. Dispatch is the only place a
//! continuation can be moved onto a particular thread: each attach names a
//! [`Dispatch`], which is resolved against the promise's [`Config`] into a
//! concrete [`DispatchContext`] (or inline execution) at attach time.

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{PromiseError, Result};

/// A unit of work handed to a dispatch context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs somewhere else
pub trait DispatchContext: Send + Sync + 'static {
    /// Schedule `job` to run on this context. Must not block.
    fn post(&self, job: Job);
}

/// Selects the context a continuation runs on
#[derive(Clone, Default)]
pub enum Dispatch {
    /// Run inline on whichever thread settles the promise
    #[default]
    Synchronous,
    /// Run on the configured foreground context
    Foreground,
    /// Run on the configured background context
    Background,
    /// Run on a caller-supplied context
    Context(Arc<dyn DispatchContext>),
}

impl Dispatch {
    pub(crate) fn resolve(&self, config: &Config) -> Result<Target> {
        match self {
            Dispatch::Synchronous => Ok(Target::Inline),
            Dispatch::Foreground => config
                .foreground()
                .cloned()
                .map(Target::Posted)
                .ok_or(PromiseError::InvalidOperation(
                    "no foreground context configured",
                )),
            Dispatch::Background => Ok(Target::Posted(config.background())),
            Dispatch::Context(context) => Ok(Target::Posted(context.clone())),
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Synchronous => write!(f, "Synchronous"),
            Dispatch::Foreground => write!(f, "Foreground"),
            Dispatch::Background => write!(f, "Background"),
            Dispatch::Context(_) => write!(f, "Context(<dyn DispatchContext>)"),
        }
    }
}

/// A resolved dispatch target
#[derive(Clone)]
pub(crate) enum Target {
    Inline,
    Posted(Arc<dyn DispatchContext>),
}

impl Target {
    pub(crate) fn run<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Target::Inline => job(),
            Target::Posted(context) => context.post(Box::new(job)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::SegQueue;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recording {
        jobs: SegQueue<Job>,
    }

    impl DispatchContext for Recording {
        fn post(&self, job: Job) {
            self.jobs.push(job);
        }
    }

    #[test]
    fn test_synchronous_runs_inline() {
        let config = Config::default();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let target = Dispatch::Synchronous.resolve(&config).unwrap();
        target.run(move || ran_clone.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_foreground_requires_configuration() {
        let config = Config::default();
        assert!(matches!(
            Dispatch::Foreground.resolve(&config),
            Err(PromiseError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_custom_context_defers_job() {
        let context = Arc::new(Recording::default());
        let config = Config::default();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let target = Dispatch::Context(context.clone()).resolve(&config).unwrap();
        target.run(move || ran_clone.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));

        let job = context.jobs.pop().unwrap();
        job();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_configured_foreground_is_used() {
        let context = Arc::new(Recording::default());
        let config = Config::builder().foreground(context.clone()).build();

        let target = Dispatch::Foreground.resolve(&config).unwrap();
        target.run(|| {});
        assert_eq!(context.jobs.len(), 1);
    }
}
