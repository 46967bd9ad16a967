//! rust-deferred: a pooled, cancellable promise runtime
//!
//! This crate provides deferred results with:
//! - A lock-free settlement state machine (exactly-once, CAS guarded)
//! - Pooled settlement nodes guarded by generation counters
//! - Single-waiter continuation linking with a lazy fan-out upgrade
//! - N-ary combinators (all, all-settled, race, first, merge) that settle
//!   exactly once no matter which producer thread finishes last
//!
//! No scheduler is owned here. Continuation bodies run wherever their
//! [`Dispatch`] says: inline on the settling thread, on a [`ForegroundContext`]
//! pumped by its owner, on the shared [`BackgroundPool`], or on any
//! caller-supplied [`DispatchContext`].
//!
//! ## Examples
//!
//! ```rust
//! use rust_deferred::{combinator, Deferred, Outcome, Promise};
//!
//! let (deferred, pending) = Deferred::<u32>::new();
//! let all = combinator::all(vec![Promise::resolved(1), pending]).unwrap();
//!
//! deferred.resolve(2).unwrap();
//! assert_eq!(all.wait(), Outcome::Resolved(vec![1, 2]));
//! ```
//!
//! # Pooling and generations
//!
//! Settlement nodes are recycled through a per-type [`NodePool`]. Every
//! recycle bumps the node's generation, so a [`Deferred`] kept past the
//! lifetime of its operation fails with
//! [`PromiseError::InvalidOperation`](error::PromiseError::InvalidOperation)
//! instead of settling an unrelated promise.
//!
//! ```rust
//! use rust_deferred::{error::PromiseError, Deferred};
//!
//! let (deferred, promise) = Deferred::<u32>::new();
//! deferred.resolve(1).unwrap();
//! assert_eq!(deferred.resolve(2), Err(PromiseError::DoubleSettle));
//! assert_eq!(promise.wait(), rust_deferred::Outcome::Resolved(1));
//!
//! // The node has been recycled; the old producer no longer reaches it
//! assert!(matches!(deferred.resolve(3), Err(PromiseError::InvalidOperation(_))));
//! ```

pub mod background;
pub mod cancellation;
pub mod combinator;
pub mod config;
pub mod continuation;
pub mod dispatch;
pub mod executor;
pub mod future;
pub mod node;
pub mod pool;
pub mod promise;
pub mod state;

// Re-export core types
pub use background::BackgroundPool;
pub use cancellation::{CancellationToken, Registration};
pub use combinator::{
    all, all_settled, first, merge2, merge3, merge4, race, race_with_index, Combinator,
};
pub use config::{Config, ConfigBuilder, UncaughtRejection};
pub use dispatch::{Dispatch, DispatchContext, Job};
pub use executor::ForegroundContext;
pub use future::PromiseFuture;
pub use node::PromiseNode;
pub use pool::{NodeId, NodePool};
pub use promise::{Deferred, Promise, PromiseId};
pub use state::{Outcome, Reason, SettlementState};

/// Values that can travel through a promise
///
/// Preserved and fan-out promises hand each waiter its own clone, and
/// settlement may complete on any thread.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// Error types for the runtime
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum PromiseError {
        /// Handle used after its node was recycled, or used twice where
        /// single-use semantics apply
        #[error("invalid operation: {0}")]
        InvalidOperation(&'static str),

        /// A producer tried to settle a promise that is already terminal
        #[error("promise already settled")]
        DoubleSettle,

        #[error("invalid argument: {0}")]
        InvalidArgument(String),

        /// Combinator arity or retain count would wrap
        #[error("counter overflow")]
        Overflow,

        #[error("global configuration already initialized")]
        AlreadyInitialized,
    }

    /// Rejection reason built from a plain message
    #[derive(Error, Debug)]
    #[error("{0}")]
    pub struct Message(pub String);

    /// Rejection reason produced when a continuation body panics
    #[derive(Error, Debug)]
    #[error("continuation panicked: {0}")]
    pub struct Panicked(pub String);

    pub type Result<T> = std::result::Result<T, PromiseError>;
}

/// Convenience function to drive a future to completion on the current thread
pub fn block_on<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    use std::sync::Arc;
    use std::task::{Context, Poll};

    let mut future = Box::pin(future);

    // Waker that unparks the current thread when the future makes progress.
    struct Parker(std::thread::Thread);
    impl futures::task::ArcWake for Parker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.unpark();
        }
    }
    let waker = futures::task::waker(Arc::new(Parker(std::thread::current())));
    let mut context = Context::from_waker(&waker);

    loop {
        match future.as_mut().poll(&mut context) {
            Poll::Ready(output) => return output,
            Poll::Pending => std::thread::park(),
        }
    }
}
