//! Configuration for the promise runtime
//!
//! This module contains tunable parameters and the process-wide [`Config`].
//! The global configuration is read-mostly and meant to be installed once at
//! startup with [`init`]; tests build isolated instances with
//! [`Config::builder`] and hand them to [`NodePool::with_config`](crate::NodePool::with_config).

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::background::BackgroundPool;
use crate::dispatch::DispatchContext;
use crate::error::{PromiseError, Result};
use crate::pool::NodeId;
use crate::state::Reason;

/// Maximum number of idle nodes kept per value type
///
/// Nodes released beyond this bound are freed instead of pooled. A larger
/// value trades memory for fewer allocations under bursty load.
pub const DEFAULT_MAX_POOLED_NODES: usize = 256;

/// Number of jobs a [`ForegroundContext`](crate::ForegroundContext) runs per tick
///
/// Bounding the batch keeps a single tick from starving the owning thread's
/// other work when continuations keep scheduling more continuations.
pub const FOREGROUND_TICK_BUDGET: usize = 64;

/// Thread name prefix for background workers
pub const BACKGROUND_THREAD_NAME_PREFIX: &str = "deferred-worker";

/// A rejection that reached the end of a chain without being observed
#[derive(Debug, Clone)]
pub struct UncaughtRejection {
    pub node: NodeId,
    pub reason: Reason,
}

pub type UncaughtHandler = Arc<dyn Fn(UncaughtRejection) + Send + Sync>;

/// Process-wide runtime configuration
pub struct Config {
    pooling: bool,
    max_pooled_nodes: usize,
    foreground: Option<Arc<dyn DispatchContext>>,
    background: Option<Arc<dyn DispatchContext>>,
    uncaught_handler: Option<UncaughtHandler>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Whether released nodes go back to their pool
    pub fn pooling(&self) -> bool {
        self.pooling
    }

    pub fn max_pooled_nodes(&self) -> usize {
        self.max_pooled_nodes
    }

    pub fn foreground(&self) -> Option<&Arc<dyn DispatchContext>> {
        self.foreground.as_ref()
    }

    /// The background context, falling back to the shared worker pool
    pub fn background(&self) -> Arc<dyn DispatchContext> {
        match &self.background {
            Some(context) => context.clone(),
            None => BackgroundPool::shared(),
        }
    }

    /// Route a rejection nobody observed
    pub(crate) fn report_uncaught(&self, rejection: UncaughtRejection) {
        match &self.uncaught_handler {
            Some(handler) => handler(rejection),
            None => tracing::error!(
                node = ?rejection.node,
                reason = %rejection.reason,
                "uncaught promise rejection"
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pooling: true,
            max_pooled_nodes: DEFAULT_MAX_POOLED_NODES,
            foreground: None,
            background: None,
            uncaught_handler: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("pooling", &self.pooling)
            .field("max_pooled_nodes", &self.max_pooled_nodes)
            .field("foreground", &self.foreground.is_some())
            .field("background", &self.background.is_some())
            .field("uncaught_handler", &self.uncaught_handler.is_some())
            .finish()
    }
}

/// Builder for [`Config`]
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Enable or disable node pooling
    pub fn pooling(mut self, enabled: bool) -> Self {
        self.config.pooling = enabled;
        self
    }

    pub fn max_pooled_nodes(mut self, max: usize) -> Self {
        self.config.max_pooled_nodes = max;
        self
    }

    /// Context used by [`Dispatch::Foreground`](crate::Dispatch::Foreground)
    pub fn foreground(mut self, context: Arc<dyn DispatchContext>) -> Self {
        self.config.foreground = Some(context);
        self
    }

    /// Context used by [`Dispatch::Background`](crate::Dispatch::Background)
    pub fn background(mut self, context: Arc<dyn DispatchContext>) -> Self {
        self.config.background = Some(context);
        self
    }

    /// Handler for rejections released without being observed
    pub fn on_uncaught_rejection<F>(mut self, handler: F) -> Self
    where
        F: Fn(UncaughtRejection) + Send + Sync + 'static,
    {
        self.config.uncaught_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Arc<Config> {
        Arc::new(self.config)
    }
}

/// Global configuration instance
static GLOBAL_CONFIG: OnceCell<Arc<Config>> = OnceCell::new();

/// Install the global configuration
///
/// Must run before the first promise is created; afterwards the default
/// configuration is already in place and this returns
/// [`PromiseError::AlreadyInitialized`].
pub fn init(config: Arc<Config>) -> Result<()> {
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| PromiseError::AlreadyInitialized)?;
    tracing::debug!("global promise configuration installed");
    Ok(())
}

/// Get the global configuration, installing the default on first use
pub fn global() -> &'static Arc<Config> {
    GLOBAL_CONFIG.get_or_init(|| Arc::new(Config::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.pooling());
        assert_eq!(config.max_pooled_nodes(), DEFAULT_MAX_POOLED_NODES);
        assert!(config.foreground().is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = Config::builder().pooling(false).max_pooled_nodes(4).build();
        assert!(!config.pooling());
        assert_eq!(config.max_pooled_nodes(), 4);
    }

    #[test]
    fn test_uncaught_handler_invoked() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let config = Config::builder()
            .on_uncaught_rejection(move |rejection| {
                assert_eq!(rejection.reason.to_string(), "lost");
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        config.report_uncaught(UncaughtRejection {
            node: NodeId::next(),
            reason: Reason::msg("lost"),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_init_is_once() {
        let _ = global();
        assert_eq!(
            init(Arc::new(Config::default())),
            Err(PromiseError::AlreadyInitialized)
        );
    }
}
