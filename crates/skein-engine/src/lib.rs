//! Skein Coroutine Engine
//!
//! A single-threaded cooperative coroutine runtime:
//! - **Scheduler**: coroutines, the ready queue and the event loop (`scheduler` module)
//! - **Worker pool**: offloads blocking callables behind a suspend point
//! - **Glue**: filesystem and resolver wrappers built on the pool (`fs`, `net`)
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_engine::{sleep, submit_work, Runtime};
//! use std::time::Duration;
//!
//! let rt = Runtime::new()?;
//! let answer = rt.block_on(|| {
//!     sleep(Duration::from_millis(5))?;
//!     submit_work(|_| Ok(6 * 7), Some(Duration::from_secs(1)))
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Scheduler module: coroutines, contexts, deadlines, event loop, worker pool
pub mod scheduler;

/// Runtime configuration and default I/O timeouts
pub mod config;

/// Error taxonomy
pub mod error;

// ============================================================================
// Glue Modules
// ============================================================================

/// Coroutine-suspending filesystem calls
pub mod fs;

/// Coroutine-suspending name resolution
pub mod net;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{
    set_timeout_default, timeout_default, Overflow, PoolConfig, RuntimeConfig, TimeoutCategory,
};
pub use error::{Error, Result};
pub use scheduler::{
    active_count, check_cancelled, current, go, sleep, spawn, stop, submit_work, submit_work_kind,
    suspend, try_current, yield_now, CancelToken, CoroutineHandle, CoroutineId, CoroutineState,
    JoinHandle, Payload, ResumeOutcome, Runtime, RuntimeHandle, RuntimeStats, WorkKind,
};
