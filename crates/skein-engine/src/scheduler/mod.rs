//! Coroutine Scheduler
//!
//! One driver thread owns the scheduler state and runs the event loop. Each
//! coroutine gets its own execution context; control moves between them by
//! synchronous switches, so only one of them executes at any instant. A
//! worker pool runs blocking callables and reports back through the event
//! queue.

mod context;
mod coroutine;
mod pool;
mod reactor;
#[allow(clippy::module_inception)]
mod scheduler;
mod timer;
mod wait;

pub use coroutine::{CoroutineHandle, CoroutineId, CoroutineState, JoinHandle, Payload, ResumeOutcome};
pub use pool::{CancelToken, WorkId, WorkKind};
pub use scheduler::{
    active_count, check_cancelled, current, go, sleep, spawn, stop, submit_work, submit_work_kind,
    suspend, try_current, yield_now, Runtime, RuntimeHandle, RuntimeStats,
};
pub use timer::{DeadlineQueue, TimerHandle};
