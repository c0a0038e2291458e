//! Worker pool: the offload bridge for blocking and CPU-bound callables
//!
//! Workers pull jobs from crossbeam channels. A job runs the callable, stores
//! the result in its `WorkTask` and posts a `WorkDone` event onto the
//! scheduler's event queue; it never touches scheduler state. Slow-IO jobs
//! go to a separate channel that only the first `slow_io_workers` threads
//! drain, so long blocking calls cannot occupy the whole pool.

use crate::config::{Overflow, PoolConfig};
use crate::error::{panic_message, Error, Result};
use crate::scheduler::coroutine::CoroutineId;
use crate::scheduler::reactor::Event;
use crate::scheduler::scheduler::Shared;
use crate::scheduler::wait::{WaitKind, Wakeup};
use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval for idle workers checking the shutdown flag
const POLL: Duration = Duration::from_millis(50);

/// Kind of offloaded work
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// CPU-bound callable
    Cpu,
    /// Short blocking syscall (stat, small reads)
    FastIo,
    /// Potentially long blocking call (DNS, large file I/O)
    SlowIo,
}

/// Cooperative cancellation flag handed to every work callable
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the work as abandoned.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the waiting side gave up on this work
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once the waiting side gave up; for use with `?`
    /// at checkpoints inside a callable.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Unique identifier for a work task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WorkId(u64);

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

impl WorkId {
    fn new() -> Self {
        WorkId(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work#{}", self.0)
    }
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// Progress of a work task, shared between the worker and the scheduler
#[derive(Debug)]
pub(crate) struct WorkState {
    id: WorkId,
    kind: WorkKind,
    status: AtomicU8,
    token: CancelToken,
}

impl WorkState {
    pub(crate) fn new(kind: WorkKind) -> Self {
        Self {
            id: WorkId::new(),
            kind,
            status: AtomicU8::new(QUEUED),
            token: CancelToken::new(),
        }
    }

    pub(crate) fn id(&self) -> WorkId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The worker stored a result (which may be a cancellation)
    pub(crate) fn is_finished(&self) -> bool {
        self.status.load(Ordering::Acquire) == FINISHED
    }

    pub(crate) fn mark_finished(&self) {
        self.status.store(FINISHED, Ordering::Release);
    }
}

/// A submitted callable's result slot
struct WorkTask<T> {
    state: Arc<WorkState>,
    result: Mutex<Option<Result<T>>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads
pub(crate) struct WorkerPool {
    general_tx: Mutex<Option<Sender<Job>>>,
    slow_tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn the worker threads.
    pub(crate) fn start(config: &PoolConfig) -> Result<Self> {
        let workers = config.worker_count();
        let slow_workers = config.slow_io_workers();
        let (general_tx, general_rx) = channel::unbounded::<Job>();
        let (slow_tx, slow_rx) = channel::unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let pool = Self {
            general_tx: Mutex::new(Some(general_tx)),
            slow_tx: Mutex::new(Some(slow_tx)),
            handles: Mutex::new(Vec::with_capacity(workers)),
            shutdown,
        };

        for index in 0..workers {
            let general = general_rx.clone();
            let slow = (index < slow_workers).then(|| slow_rx.clone());
            let flag = pool.shutdown.clone();
            let spawned = thread::Builder::new()
                .name(format!("skein-worker-{index}"))
                .spawn(move || Self::worker_loop(general, slow, flag));
            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(err.into());
                }
            }
        }

        tracing::debug!(workers, slow_workers, "worker pool started");
        Ok(pool)
    }

    /// Whether `shutdown` has been called
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Queue a job for the workers serving `kind`.
    fn dispatch(&self, kind: WorkKind, job: Job) -> Result<()> {
        let lane = match kind {
            WorkKind::SlowIo => &self.slow_tx,
            WorkKind::Cpu | WorkKind::FastIo => &self.general_tx,
        };
        let guard = lane.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::PoolShutdown);
        };
        tx.send(job).map_err(|_| Error::PoolShutdown)
    }

    /// Stop accepting work and join the workers (2s each, then detach).
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        drop(self.general_tx.lock().take());
        drop(self.slow_tx.lock().take());

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let timeout = Duration::from_secs(2);
        for handle in handles {
            Self::join_with_timeout(handle, timeout);
        }
        tracing::debug!("worker pool stopped");
    }

    /// Join a thread with timeout, detach if stuck.
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                tracing::warn!(
                    worker = handle.thread().name().unwrap_or("?"),
                    "worker still busy at shutdown, detaching"
                );
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    // ========================================================================
    // Worker Loop
    // ========================================================================

    fn worker_loop(general: Receiver<Job>, slow: Option<Receiver<Job>>, shutdown: Arc<AtomicBool>) {
        loop {
            let job = match &slow {
                Some(slow) => select! {
                    recv(general) -> msg => msg.ok(),
                    recv(slow) -> msg => msg.ok(),
                    default(POLL) => None,
                },
                None => general.recv_timeout(POLL).ok(),
            };
            match job {
                Some(job) => job(),
                None if shutdown.load(Ordering::Acquire) => break,
                None => {}
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run a submitted callable on the worker thread.
fn run_callable<T, F>(task: &WorkTask<T>, f: F) -> Result<T>
where
    F: FnOnce(&CancelToken) -> Result<T>,
{
    let state = &task.state;
    if state.token.is_cancelled() {
        return Err(Error::Cancelled);
    }
    state.status.store(RUNNING, Ordering::Release);
    match catch_unwind(AssertUnwindSafe(|| f(&state.token))) {
        Ok(result) => result,
        Err(payload) => Err(Error::underlying(format!(
            "work callable panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

// ============================================================================
// Submission (scheduler side)
// ============================================================================

impl Shared {
    /// Offload `f` to the pool and park `me` until it completes, times out or
    /// is cancelled.
    pub(crate) fn submit<T, F>(
        self: &Arc<Self>,
        me: CoroutineId,
        kind: WorkKind,
        f: F,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let remaining = || deadline.map(|d| d.saturating_duration_since(Instant::now()));

        // Wait for an in-flight slot when the pool is bounded
        loop {
            {
                let st = self.state.lock();
                if self.pool.is_shut_down() {
                    return Err(Error::PoolShutdown);
                }
                match self.config.pool.capacity() {
                    Some(cap) if st.in_flight >= cap => {
                        if self.config.pool.overflow == Overflow::Reject {
                            return Err(Error::PoolExhausted);
                        }
                    }
                    _ => break,
                }
            }
            let wake = self.park(me, WaitKind::PoolSlot, remaining(), |st, key| {
                st.slot_waiters.push_back(key);
                Ok(())
            })?;
            match wake {
                Wakeup::TimedOut => return Err(Error::Timeout),
                Wakeup::Cancelled => return Err(Error::Cancelled),
                _ => {}
            }
        }

        let state = Arc::new(WorkState::new(kind));
        let task = Arc::new(WorkTask {
            state: state.clone(),
            result: Mutex::new(None),
        });
        let job_task = task.clone();
        let events = self.events_tx.clone();

        let mut dispatched = false;
        let parked = self.park(me, WaitKind::Work(state.clone()), remaining(), |st, key| {
            let job: Job = Box::new(move || {
                let result = run_callable(&job_task, f);
                *job_task.result.lock() = Some(result);
                job_task.state.mark_finished();
                let work = job_task.state.id;
                drop(job_task);
                // The runtime may be gone already; nobody is waiting then.
                let _ = events.send(Event::WorkDone { key, work });
            });
            self.pool.dispatch(kind, job)?;
            st.in_flight += 1;
            st.stats.work_submitted += 1;
            dispatched = true;
            Ok(())
        });
        if !dispatched {
            // A slot handed to this submission must pass on to the next waiter
            self.release_slot();
        }
        let wake = parked?;

        tracing::trace!(work = %state.id, kind = ?state.kind, outcome = ?wake, "work wait resolved");
        match wake {
            Wakeup::Completed => task
                .result
                .lock()
                .take()
                .unwrap_or_else(|| Err(Error::InvalidState("work result missing".into()))),
            Wakeup::TimedOut => Err(Error::Timeout),
            Wakeup::Cancelled => Err(Error::Cancelled),
            other => Err(Error::InvalidState(format!(
                "unexpected wakeup {other:?} for {}",
                state.id
            ))),
        }
    }
}

impl Shared {
    /// Wake the next slot waiter if the pool has room for it.
    fn release_slot(&self) {
        let mut st = self.state.lock();
        let room = self
            .config
            .pool
            .capacity()
            .map_or(true, |cap| st.in_flight < cap);
        if room {
            st.wake_slot_waiter();
        }
    }
}
