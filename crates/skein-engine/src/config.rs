//! Runtime configuration and the process-wide I/O timeout table.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default execution context stack size (256 KiB)
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default capacity of the worker → scheduler event queue
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default number of worker threads
pub const DEFAULT_WORKERS: usize = 4;

/// What a submission does when the pool is at its in-flight limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    /// Suspend the submitting coroutine until a slot frees or it times out
    Wait,
    /// Fail immediately with `PoolExhausted`
    Reject,
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker thread count (0 = one per CPU)
    pub workers: usize,

    /// Tasks allowed in flight beyond the worker count (None = unbounded)
    pub max_pending: Option<usize>,

    /// Behaviour when `max_pending` is reached
    pub overflow: Overflow,

    /// Fraction of workers that may serve slow-IO work (at least one)
    pub slow_io_share: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_pending: None,
            overflow: Overflow::Wait,
            slow_io_share: 0.5,
        }
    }
}

impl PoolConfig {
    /// Resolved worker thread count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// Number of workers that also drain the slow-IO queue.
    pub fn slow_io_workers(&self) -> usize {
        let n = self.worker_count();
        let share = self.slow_io_share.clamp(0.0, 1.0);
        ((n as f32 * share).floor() as usize).clamp(1, n)
    }

    /// Maximum tasks in flight (queued + running), None when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.max_pending.map(|pending| self.worker_count() + pending)
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stack size for each coroutine's execution context, in bytes
    pub stack_size: usize,

    /// Capacity of the bounded worker → scheduler event queue
    pub event_capacity: usize,

    /// How long teardown lets cancelled coroutines run their cleanup
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,

    /// Worker pool settings
    pub pool: PoolConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            shutdown_grace: Duration::from_secs(1),
            pool: PoolConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(src)
            .map_err(|e| Error::underlying(format!("bad runtime config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }

    /// Set the context stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the worker thread count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    /// Bound the pool: `pending` queued tasks beyond the workers, with `overflow` policy.
    pub fn with_max_pending(mut self, pending: usize, overflow: Overflow) -> Self {
        self.pool.max_pending = Some(pending);
        self.pool.overflow = overflow;
        self
    }

    /// Set the teardown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::underlying("event_capacity must be > 0"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(Error::underlying(format!(
                "stack_size {} is below the 16 KiB minimum",
                self.stack_size
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// Default I/O timeouts
// ============================================================================

/// I/O categories with a process-wide default timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutCategory {
    /// Host name resolution
    Resolve,
    /// Accepting a connection
    Accept,
    /// Establishing a connection
    Connect,
    /// Reading
    Read,
    /// Writing
    Write,
}

#[derive(Debug, Clone, Copy)]
struct TimeoutTable {
    resolve: Option<Duration>,
    accept: Option<Duration>,
    connect: Option<Duration>,
    read: Option<Duration>,
    write: Option<Duration>,
}

impl TimeoutTable {
    fn get(&self, category: TimeoutCategory) -> Option<Duration> {
        match category {
            TimeoutCategory::Resolve => self.resolve,
            TimeoutCategory::Accept => self.accept,
            TimeoutCategory::Connect => self.connect,
            TimeoutCategory::Read => self.read,
            TimeoutCategory::Write => self.write,
        }
    }

    fn slot(&mut self, category: TimeoutCategory) -> &mut Option<Duration> {
        match category {
            TimeoutCategory::Resolve => &mut self.resolve,
            TimeoutCategory::Accept => &mut self.accept,
            TimeoutCategory::Connect => &mut self.connect,
            TimeoutCategory::Read => &mut self.read,
            TimeoutCategory::Write => &mut self.write,
        }
    }
}

static TIMEOUTS: Lazy<RwLock<TimeoutTable>> = Lazy::new(|| {
    RwLock::new(TimeoutTable {
        resolve: Some(Duration::from_secs(5)),
        accept: None,
        connect: Some(Duration::from_secs(5)),
        read: None,
        write: None,
    })
});

/// Set the default timeout for an I/O category (`None` = wait forever).
pub fn set_timeout_default(category: TimeoutCategory, timeout: Option<Duration>) {
    *TIMEOUTS.write().slot(category) = timeout;
}

/// Look up the default timeout for an I/O category.
pub fn timeout_default(category: TimeoutCategory) -> Option<Duration> {
    TIMEOUTS.read().get(category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.pool.worker_count(), DEFAULT_WORKERS);
        assert_eq!(config.pool.capacity(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            stack_size = 65536
            shutdown_grace = 250

            [pool]
            workers = 2
            max_pending = 3
            overflow = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.stack_size, 65536);
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.pool.worker_count(), 2);
        assert_eq!(config.pool.capacity(), Some(5));
        assert_eq!(config.pool.overflow, Overflow::Reject);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_from_toml_rejects_tiny_stack() {
        let err = RuntimeConfig::from_toml_str("stack_size = 1024").unwrap_err();
        assert!(matches!(err, Error::Underlying { code: None, .. }));
    }

    #[test]
    fn test_from_toml_malformed_is_not_a_state_error() {
        let err = RuntimeConfig::from_toml_str("stack_size = \"big\"").unwrap_err();
        match err {
            Error::Underlying { message, .. } => assert!(message.starts_with("bad runtime config")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_slow_io_workers() {
        let mut pool = PoolConfig {
            workers: 4,
            ..PoolConfig::default()
        };
        assert_eq!(pool.slow_io_workers(), 2);
        pool.workers = 1;
        assert_eq!(pool.slow_io_workers(), 1);
        pool.workers = 8;
        pool.slow_io_share = 0.0;
        assert_eq!(pool.slow_io_workers(), 1);
    }

    #[test]
    fn test_timeout_table() {
        // Touches the write slot only; other tests read the rest.
        set_timeout_default(TimeoutCategory::Write, Some(Duration::from_millis(7)));
        assert_eq!(
            timeout_default(TimeoutCategory::Write),
            Some(Duration::from_millis(7))
        );
        set_timeout_default(TimeoutCategory::Write, None);
        assert_eq!(timeout_default(TimeoutCategory::Write), None);
        assert_eq!(timeout_default(TimeoutCategory::Accept), None);
    }
}
