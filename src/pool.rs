//! Node pooling
//!
//! Each value type gets its own [`NodePool`]. Released nodes come back here
//! with their generation already bumped, so renting one out again can never
//! revive a handle from its previous life.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::config::{self, Config};
use crate::node::PromiseNode;
use crate::Value;

/// Unique identifier for a settlement node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

static NODE_COUNTER: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    pub(crate) fn next() -> Self {
        Self(NODE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A free list of settlement nodes for one value type
pub struct NodePool<T: Value> {
    free: SegQueue<Arc<PromiseNode<T>>>,
    idle: AtomicUsize,
    allocated: AtomicUsize,
    config: Arc<Config>,
    this: Weak<NodePool<T>>,
}

/// Shared pools keyed by value type
static SHARED_POOLS: Lazy<DashMap<TypeId, Arc<dyn Any + Send + Sync>>> = Lazy::new(DashMap::new);

impl<T: Value> NodePool<T> {
    /// A private pool using `config`
    pub fn with_config(config: Arc<Config>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            free: SegQueue::new(),
            idle: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            config,
            this: this.clone(),
        })
    }

    /// The process-wide pool for `T`, using the global configuration
    pub fn shared() -> Arc<Self> {
        let entry = SHARED_POOLS
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                let pool: Arc<dyn Any + Send + Sync> = Self::with_config(config::global().clone());
                pool
            })
            .clone();

        match entry.downcast::<Self>() {
            Ok(pool) => pool,
            // Keys are the pool's own TypeId
            Err(_) => Self::with_config(config::global().clone()),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Take a node ready to back a new pending promise
    ///
    /// Returns the node together with the generation the new handles must
    /// carry.
    pub(crate) fn rent(&self) -> (Arc<PromiseNode<T>>, u32) {
        if let Some(node) = self.free.pop() {
            self.idle.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(node.is_idle(), "pooled node still has waiters");
            let generation = node.generation();
            tracing::trace!(node = ?node.id(), generation, "reusing pooled node");
            return (node, generation);
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(PromiseNode::new(
            NodeId::next(),
            self.this.clone(),
            self.config.clone(),
        ));
        let generation = node.generation();
        (node, generation)
    }

    /// Return a recycled node to the free list, or drop it when full
    pub(crate) fn give_back(&self, node: Arc<PromiseNode<T>>) {
        let max = self.config.max_pooled_nodes();
        let previous = self.idle.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            self.idle.fetch_sub(1, Ordering::AcqRel);
            tracing::trace!(node = ?node.id(), "pool full, freeing node");
            return;
        }
        self.free.push(node);
    }

    /// Number of nodes waiting to be reused
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Number of nodes this pool has ever allocated
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Free every idle node
    pub fn clear(&self) {
        while self.free.pop().is_some() {
            self.idle.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<T: Value> std::fmt::Debug for NodePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("idle", &self.idle())
            .field("allocated", &self.allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Deferred;

    fn pool(max: usize) -> Arc<NodePool<u32>> {
        NodePool::with_config(Config::builder().max_pooled_nodes(max).build())
    }

    #[test]
    fn test_node_ids_are_unique() {
        let a = NodeId::next();
        let b = NodeId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_released_node_is_reused_with_new_generation() {
        let pool = pool(8);

        let (deferred, promise) = Deferred::new_in(&pool);
        let first_id = promise.id();
        deferred.resolve(1).unwrap();
        drop(promise.wait());

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.allocated(), 1);

        let (_deferred, promise) = Deferred::new_in(&pool);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(promise.id().node(), first_id.node());
        assert_eq!(promise.id().generation(), first_id.generation() + 1);
    }

    #[test]
    fn test_pool_respects_max_idle() {
        let pool = pool(1);

        let pairs: Vec<_> = (0..3).map(|_| Deferred::new_in(&pool)).collect();
        for (deferred, promise) in pairs {
            deferred.resolve(7).unwrap();
            drop(promise.wait());
        }

        assert_eq!(pool.allocated(), 3);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_pooling_disabled_never_reuses() {
        let pool = NodePool::<u32>::with_config(Config::builder().pooling(false).build());

        let (deferred, promise) = Deferred::new_in(&pool);
        deferred.resolve(1).unwrap();
        drop(promise.wait());

        assert_eq!(pool.idle(), 0);
        let _pair = Deferred::new_in(&pool);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn test_shared_pool_is_per_type() {
        let a = NodePool::<u64>::shared();
        let b = NodePool::<u64>::shared();
        assert!(Arc::ptr_eq(&a, &b));

        let c = NodePool::<String>::shared();
        assert_eq!(c.config().max_pooled_nodes(), a.config().max_pooled_nodes());
    }

    #[test]
    fn test_clear_drops_idle_nodes() {
        let pool = pool(8);
        let (deferred, promise) = Deferred::new_in(&pool);
        deferred.resolve(1).unwrap();
        drop(promise.wait());

        pool.clear();
        assert_eq!(pool.idle(), 0);
    }
}
