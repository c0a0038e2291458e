//! Coroutine identity, lifecycle state and the handles user code holds.

use crate::error::{Error, Result};
use crate::scheduler::context::Context;
use crate::scheduler::scheduler::{scope, Shared};
use crate::scheduler::wait::{PendingWait, WaitKey, WaitKind, Wakeup};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Value handed to a coroutine by an explicit resume
pub type Payload = Box<dyn Any + Send>;

/// Unique identifier for a coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u64);

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

impl CoroutineId {
    /// Generate a new unique CoroutineId
    pub(crate) fn new() -> Self {
        CoroutineId(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a CoroutineId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        CoroutineId(id)
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co#{}", self.0)
    }
}

/// Lifecycle state of a coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroutineState {
    /// Parked on a suspend point, or switched away from by a direct resume
    Waiting,
    /// Queued for the dispatch loop
    Ready,
    /// Currently executing
    Running,
    /// Entry function returned; the context has been released
    Dead,
}

/// What happened to the target of a resume once control came back
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The target suspended again
    Suspended,
    /// The target ran to completion
    Finished,
}

/// Per-coroutine scheduler record
pub(crate) struct CoroutineSlot {
    pub(crate) state: CoroutineState,
    pub(crate) context: Arc<Context>,
    /// Whoever switched into this coroutine last; control returns there on suspend
    pub(crate) caller: Option<CoroutineId>,
    pub(crate) wait: Option<PendingWait>,
    /// Resume slot: written by the claimer, taken once on resumption
    pub(crate) wake: Option<Wakeup>,
    pub(crate) cancel_pending: bool,
    pub(crate) joiner: Option<WaitKey>,
}

impl CoroutineSlot {
    pub(crate) fn new(state: CoroutineState, context: Arc<Context>) -> Self {
        Self {
            state,
            context,
            caller: None,
            wait: None,
            wake: None,
            cancel_pending: false,
            joiner: None,
        }
    }
}

/// Handle to a coroutine
///
/// Cheap to clone. Holds only a weak reference to its runtime, so a handle
/// that outlives the runtime reports `Dead` and refuses to resume.
#[derive(Clone)]
pub struct CoroutineHandle {
    id: CoroutineId,
    shared: Weak<Shared>,
}

impl CoroutineHandle {
    pub(crate) fn new(id: CoroutineId, shared: &Arc<Shared>) -> Self {
        Self {
            id,
            shared: Arc::downgrade(shared),
        }
    }

    /// The coroutine's id
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoroutineState {
        match self.shared.upgrade() {
            Some(shared) => shared.state_of(self.id),
            None => CoroutineState::Dead,
        }
    }

    /// Transfer control to this coroutine, delivering `payload` if it is
    /// parked in `suspend`. Returns once it suspends again or finishes.
    ///
    /// # Panics
    ///
    /// Panics when the resume breaks the scheduling contract: the target is
    /// dead, already running, the caller itself, or the call comes from a
    /// thread that is not running on the target's runtime. Use `try_resume`
    /// to get those back as `Error::InvalidState`.
    pub fn resume<P: Any + Send>(&self, payload: P) -> ResumeOutcome {
        match self.try_resume(payload) {
            Ok(outcome) => outcome,
            Err(err) => panic!("skein: illegal resume of {}: {err}", self.id),
        }
    }

    /// Fallible twin of `resume`.
    pub fn try_resume<P: Any + Send>(&self, payload: P) -> Result<ResumeOutcome> {
        let shared = self.runtime()?;
        let me = same_runtime_scope(&shared)?;
        shared.transfer(me, self.id, Some(Box::new(payload)))
    }

    /// Request cancellation. A parked coroutine wakes with `Cancelled`; a
    /// running or ready one sees `Cancelled` at its next suspend point.
    /// Returns false if the coroutine is already dead.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(self.id),
            None => false,
        }
    }

    fn runtime(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| Error::InvalidState("runtime has been dropped".into()))
    }
}

impl fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for CoroutineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CoroutineHandle {}

/// Calling coroutine's id, if the caller runs on `shared`.
fn same_runtime_scope(shared: &Arc<Shared>) -> Result<CoroutineId> {
    match scope() {
        Some(s) if Arc::ptr_eq(&s.shared, shared) => Ok(s.id),
        Some(_) => Err(Error::InvalidState(
            "coroutine belongs to a different runtime".into(),
        )),
        None => Err(Error::InvalidState(
            "caller is not running inside a skein runtime".into(),
        )),
    }
}

pub(crate) type ResultSlot<T> = Arc<Mutex<Option<Result<T>>>>;

/// Owned handle to a spawned coroutine's result
pub struct JoinHandle<T> {
    handle: CoroutineHandle,
    result: ResultSlot<T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(handle: CoroutineHandle, result: ResultSlot<T>) -> Self {
        Self { handle, result }
    }

    /// Handle to the underlying coroutine
    pub fn coroutine(&self) -> &CoroutineHandle {
        &self.handle
    }

    /// The coroutine's id
    pub fn id(&self) -> CoroutineId {
        self.handle.id()
    }

    /// Whether the coroutine has finished and its result is waiting
    pub fn is_finished(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Request cancellation of the coroutine.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Suspend until the coroutine finishes and take its result.
    ///
    /// A coroutine that panicked yields `Underlying`; one torn down during
    /// runtime shutdown yields `Cancelled`. If the joining coroutine is
    /// itself cancelled while waiting the join returns `Cancelled` and the
    /// target keeps running.
    pub fn join(mut self) -> Result<T> {
        self.wait(None)
    }

    /// Like `join`, but gives up with `Timeout` after `timeout`. The handle
    /// stays usable after a timeout.
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<T> {
        self.wait(Some(timeout))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<T> {
        if let Some(result) = self.result.lock().take() {
            return result;
        }
        let shared = self.handle.runtime()?;
        let me = same_runtime_scope(&shared)?;
        let target = self.handle.id;
        if me == target {
            return Err(Error::InvalidState(format!("{me} cannot join itself")));
        }

        loop {
            if let Some(result) = self.result.lock().take() {
                return result;
            }
            let wake = shared.park(me, WaitKind::Join(target), timeout, |st, key| {
                match st.coroutines.get_mut(&target) {
                    Some(slot) => {
                        slot.joiner = Some(key);
                        Ok(())
                    }
                    None => Err(Error::InvalidState(format!(
                        "{target} is dead and its result was already taken"
                    ))),
                }
            })?;
            match wake {
                Wakeup::TimedOut => return Err(Error::Timeout),
                Wakeup::Cancelled => return Err(Error::Cancelled),
                _ => {}
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.handle.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
