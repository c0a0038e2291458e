//! Coroutine scheduler and the `Runtime` context object
//!
//! All scheduler state lives in one `SchedState` behind a mutex inside
//! `Shared`. Coroutines run on their own contexts, but only the context
//! holding the baton executes, so the lock is never contended by two
//! coroutines; it exists to hand the state across the context threads and to
//! let foreign threads post cancel and stop requests.
//!
//! The thread that creates a `Runtime` becomes the driver frame (the root
//! pseudo-coroutine). It is the only frame that runs the event loop: when it
//! suspends, its suspend point drives ticks until its own wait resolves.

use crate::config::RuntimeConfig;
use crate::error::{panic_message, Error, Result};
use crate::scheduler::context::{Context, ContextExit};
use crate::scheduler::coroutine::{
    CoroutineHandle, CoroutineId, CoroutineSlot, CoroutineState, JoinHandle, Payload,
    ResultSlot, ResumeOutcome,
};
use crate::scheduler::pool::{CancelToken, WorkKind, WorkerPool};
use crate::scheduler::reactor::{Event, Progress};
use crate::scheduler::timer::DeadlineQueue;
use crate::scheduler::wait::{WaitKey, WaitKind, Wakeup};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Runtime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Coroutines created
    pub spawned: u64,

    /// Coroutines whose entry returned (or was torn down)
    pub finished: u64,

    /// Context switches into a coroutine
    pub resumes: u64,

    /// Work waits resolved by completion
    pub completions: u64,

    /// Suspend points resolved by a deadline
    pub timeouts: u64,

    /// Suspend points resolved by cancellation
    pub cancellations: u64,

    /// Work tasks handed to the pool
    pub work_submitted: u64,
}

/// Scheduler-thread state
pub(crate) struct SchedState {
    pub(crate) coroutines: FxHashMap<CoroutineId, CoroutineSlot>,
    pub(crate) ready: VecDeque<CoroutineId>,
    /// Coroutine holding the baton (`root` in the driver frame)
    pub(crate) current: CoroutineId,
    pub(crate) root: CoroutineId,
    pub(crate) deadlines: DeadlineQueue<WaitKey>,
    /// Contexts of finished coroutines, joined by the next tick
    pub(crate) graveyard: Vec<Arc<Context>>,
    /// Work tasks dispatched and not yet reported back
    pub(crate) in_flight: usize,
    pub(crate) slot_waiters: VecDeque<WaitKey>,
    pub(crate) stop_requested: bool,
    pub(crate) stats: RuntimeStats,
    pub(crate) next_wait_seq: u64,
}

impl SchedState {
    pub(crate) fn state_of(&self, id: CoroutineId) -> CoroutineState {
        self.coroutines
            .get(&id)
            .map_or(CoroutineState::Dead, |slot| slot.state)
    }

    /// Mark `caller` as the running coroutine and return its context.
    fn hand_back_to(&mut self, caller: CoroutineId) -> Option<Arc<Context>> {
        let target = if self.coroutines.contains_key(&caller) {
            caller
        } else {
            self.root
        };
        let slot = self.coroutines.get_mut(&target)?;
        slot.state = CoroutineState::Running;
        self.current = target;
        Some(slot.context.clone())
    }
}

/// State shared between the driver, the coroutine contexts and the handles
pub(crate) struct Shared {
    pub(crate) state: Mutex<SchedState>,
    pub(crate) events_tx: Sender<Event>,
    pub(crate) events_rx: Receiver<Event>,
    pub(crate) pool: WorkerPool,
    pub(crate) config: RuntimeConfig,
    pub(crate) root: CoroutineId,
    /// Live `RuntimeHandle`s; while any exist an idle loop waits for events
    pub(crate) handles: AtomicUsize,
}

// ============================================================================
// Per-thread scope
// ============================================================================

/// Which runtime and coroutine the calling thread is executing
#[derive(Clone)]
pub(crate) struct Scope {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: CoroutineId,
}

thread_local! {
    static CURRENT: RefCell<Option<Scope>> = const { RefCell::new(None) };
}

pub(crate) fn scope() -> Option<Scope> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

fn enter(scope: Scope) {
    CURRENT.with(|current| *current.borrow_mut() = Some(scope));
}

fn leave() {
    let _ = CURRENT.try_with(|current| current.borrow_mut().take());
}

fn require_scope() -> Result<Scope> {
    scope().ok_or_else(|| Error::InvalidState("not running inside a skein runtime".into()))
}

impl Shared {
    pub(crate) fn state_of(&self, id: CoroutineId) -> CoroutineState {
        self.state.lock().state_of(id)
    }

    fn is_own_thread(self: &Arc<Self>) -> bool {
        scope().is_some_and(|s| Arc::ptr_eq(&s.shared, self))
    }

    pub(crate) fn active_count(&self) -> usize {
        self.state.lock().coroutines.len()
    }

    // ========================================================================
    // Spawn / finish
    // ========================================================================

    /// Create a coroutine and queue it Ready. Its context starts lazily on
    /// the first switch into it.
    pub(crate) fn spawn_coroutine<F, T>(self: &Arc<Self>, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = CoroutineId::new();
        let result: ResultSlot<T> = Arc::new(Mutex::new(None));
        let shared = Arc::clone(self);
        let entry_result = result.clone();
        let context = Context::new(
            format!("skein-co-{}", id.as_u64()),
            self.config.stack_size,
            Box::new(move || shared.run_entry(id, f, entry_result)),
        );

        let mut st = self.state.lock();
        st.coroutines
            .insert(id, CoroutineSlot::new(CoroutineState::Ready, context));
        st.ready.push_back(id);
        st.stats.spawned += 1;
        drop(st);

        tracing::trace!(coroutine = %id, "spawn");
        JoinHandle::new(CoroutineHandle::new(id, self), result)
    }

    /// Body of every coroutine context.
    fn run_entry<F, T>(self: Arc<Self>, id: CoroutineId, f: F, result: ResultSlot<T>)
    where
        F: FnOnce() -> T,
    {
        enter(Scope {
            shared: self.clone(),
            id,
        });
        let (value, forced) = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => (Ok(value), false),
            Err(payload) if payload.is::<ContextExit>() => (Err(Error::Cancelled), true),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(coroutine = %id, %message, "coroutine panicked");
                (
                    Err(Error::underlying(format!("coroutine panicked: {message}"))),
                    false,
                )
            }
        };
        *result.lock() = Some(value);
        drop(result);
        leave();
        self.finish(id, forced);
    }

    /// Retire a coroutine whose entry returned and hand control back to its
    /// caller. A `forced` finish happens during teardown, while the driver
    /// is blocked joining this context, so control is not handed anywhere.
    fn finish(&self, id: CoroutineId, forced: bool) {
        let mut st = self.state.lock();
        let Some(mut slot) = st.coroutines.remove(&id) else {
            return;
        };
        if let Some(wait) = slot.wait.take() {
            if let Some(timer) = wait.timer {
                st.deadlines.cancel(timer);
            }
            match &wait.kind {
                WaitKind::Work(work) => work.token().cancel(),
                WaitKind::PoolSlot => st.slot_waiters.retain(|k| *k != wait.key),
                _ => {}
            }
        }
        st.stats.finished += 1;
        if let Some(joiner) = slot.joiner.take() {
            st.claim(joiner, Wakeup::Ready);
        }
        st.graveyard.push(slot.context.clone());
        tracing::trace!(coroutine = %id, forced, "finish");

        if forced {
            drop(st);
            return;
        }
        let caller = slot.caller.unwrap_or(self.root);
        let to = st.hand_back_to(caller);
        drop(st);
        drop(slot);
        if let Some(to) = to {
            Context::hand_off(&to);
        }
    }

    // ========================================================================
    // Control transfer
    // ========================================================================

    /// Switch from `resumer` (the running coroutine) into `target` and block
    /// until control comes back.
    pub(crate) fn transfer(
        self: &Arc<Self>,
        resumer: CoroutineId,
        target: CoroutineId,
        payload: Option<Payload>,
    ) -> Result<ResumeOutcome> {
        let mut st = self.state.lock();
        if st.current != resumer {
            return Err(Error::InvalidState(format!(
                "{resumer} is not the running coroutine"
            )));
        }
        if target == resumer {
            return Err(Error::InvalidState(format!("{target} cannot resume itself")));
        }
        if target == self.root {
            return Err(Error::InvalidState(
                "the driver frame is resumed by the event loop only".into(),
            ));
        }
        let Some(slot) = st.coroutines.get(&target) else {
            return Err(Error::InvalidState(format!("{target} is dead")));
        };
        let pending = slot
            .wait
            .as_ref()
            .map(|w| (w.key, matches!(w.kind, WaitKind::Explicit)));
        match (slot.state, pending) {
            (CoroutineState::Running, _) => {
                return Err(Error::InvalidState(format!("{target} is already running")));
            }
            (CoroutineState::Dead, _) => {
                return Err(Error::InvalidState(format!("{target} is dead")));
            }
            (CoroutineState::Waiting, None) => {
                return Err(Error::InvalidState(format!(
                    "{target} is waiting on a coroutine it resumed"
                )));
            }
            _ => {}
        }
        let context = slot.context.clone();
        context.start()?;

        // An explicit resume resolves the pending wait: `suspend` receives the
        // payload, any protocol wait is cancelled.
        if let Some((key, explicit)) = pending {
            let wake = if explicit {
                Wakeup::Value(payload.unwrap_or_else(|| Box::new(())))
            } else {
                Wakeup::Cancelled
            };
            st.claim(key, wake);
        }
        st.ready.retain(|id| *id != target);

        let Some(from) = st.coroutines.get_mut(&resumer).map(|slot| {
            slot.state = CoroutineState::Waiting;
            slot.context.clone()
        }) else {
            return Err(Error::InvalidState(format!("{resumer} is dead")));
        };
        if let Some(slot) = st.coroutines.get_mut(&target) {
            slot.state = CoroutineState::Running;
            slot.caller = Some(resumer);
        }
        st.current = target;
        st.stats.resumes += 1;
        drop(st);

        tracing::trace!(from = %resumer, to = %target, "resume");
        Context::switch(&from, &context);

        let finished = !self.state.lock().coroutines.contains_key(&target);
        Ok(if finished {
            ResumeOutcome::Finished
        } else {
            ResumeOutcome::Suspended
        })
    }

    /// Suspend `me` on a wait of `kind`.
    ///
    /// `arm` runs under the scheduler lock once the wait is registered and
    /// connects it to whatever will claim it (the pool, a join target). If
    /// it fails the wait is rolled back and the error returned. Exactly one
    /// `Wakeup` comes back per successful call.
    pub(crate) fn park<A>(
        self: &Arc<Self>,
        me: CoroutineId,
        kind: WaitKind,
        timeout: Option<Duration>,
        arm: A,
    ) -> Result<Wakeup>
    where
        A: FnOnce(&mut SchedState, WaitKey) -> Result<()>,
    {
        // Cleanup code running during a forced teardown must not suspend
        if thread::panicking() {
            return Ok(Wakeup::Cancelled);
        }

        let mut st = self.state.lock();
        if st.current != me {
            return Err(Error::InvalidState(format!(
                "{me} is not the running coroutine"
            )));
        }
        let cancelled = st
            .coroutines
            .get_mut(&me)
            .is_some_and(|slot| std::mem::take(&mut slot.cancel_pending));
        if cancelled {
            st.stats.cancellations += 1;
            return Ok(Wakeup::Cancelled);
        }

        let key = st.begin_wait(me, kind, timeout);
        if let Err(err) = arm(&mut st, key) {
            st.abort_wait(key);
            return Err(err);
        }
        tracing::trace!(coroutine = %me, "suspend");

        if me == self.root {
            drop(st);
            return Ok(self.drive_until_woken(key));
        }

        let caller = st
            .coroutines
            .get_mut(&me)
            .and_then(|slot| slot.caller.take())
            .unwrap_or(self.root);
        let from = st.coroutines.get(&me).map(|slot| slot.context.clone());
        let to = st.hand_back_to(caller);
        let (Some(from), Some(to)) = (from, to) else {
            return Err(Error::InvalidState(format!("{me} has no context to suspend")));
        };
        drop(st);

        Context::switch(&from, &to);

        self.state
            .lock()
            .coroutines
            .get_mut(&me)
            .and_then(|slot| slot.wake.take())
            .ok_or_else(|| Error::InvalidState(format!("{me} resumed without an outcome")))
    }

    /// Driver-frame suspension: run the event loop until `key` resolves.
    fn drive_until_woken(self: &Arc<Self>, key: WaitKey) -> Wakeup {
        loop {
            let progress = self.tick(None);
            let mut st = self.state.lock();
            if let Some(slot) = st.coroutines.get_mut(&self.root) {
                if let Some(wake) = slot.wake.take() {
                    slot.state = CoroutineState::Running;
                    return wake;
                }
            }
            if progress == Progress::Stalled {
                tracing::warn!("driver frame waits on a suspend point nothing can resolve");
                st.claim(key, Wakeup::Cancelled);
            }
        }
    }

    // ========================================================================
    // Cancel / stop
    // ========================================================================

    /// Cancel `id`. From a foreign thread the request is queued for the
    /// next tick.
    pub(crate) fn cancel(self: &Arc<Self>, id: CoroutineId) -> bool {
        if self.is_own_thread() {
            let applied = self.state.lock().apply_cancel(id);
            if applied {
                tracing::debug!(coroutine = %id, "cancel requested");
            }
            return applied;
        }
        if self.state_of(id) == CoroutineState::Dead {
            return false;
        }
        self.events_tx.send(Event::Cancel(id)).is_ok()
    }

    pub(crate) fn stop(self: &Arc<Self>) {
        if self.is_own_thread() {
            self.state.lock().stop_requested = true;
        } else {
            let _ = self.events_tx.send(Event::Stop);
        }
    }

    // ========================================================================
    // Run loop and teardown
    // ========================================================================

    fn run(self: &Arc<Self>) -> Result<()> {
        if self.state.lock().current != self.root {
            return Err(Error::InvalidState(
                "run must be called from the driver frame".into(),
            ));
        }
        tracing::debug!("event loop running");
        loop {
            {
                let mut st = self.state.lock();
                if st.stop_requested {
                    st.stop_requested = false;
                    tracing::debug!("event loop stopped on request");
                    return Ok(());
                }
                if st.coroutines.len() == 1 && st.ready.is_empty() {
                    tracing::debug!("event loop idle: no coroutines left");
                    return Ok(());
                }
            }
            if self.tick(None) == Progress::Stalled {
                tracing::warn!(
                    waiting = self.active_count().saturating_sub(1),
                    "event loop stalled: remaining coroutines wait on nothing that can wake them"
                );
                return Ok(());
            }
        }
    }

    /// Cancel every coroutine, give them `shutdown_grace` to finish, stop the
    /// pool and destroy whatever is left.
    fn teardown(self: &Arc<Self>) {
        let grace = self.config.shutdown_grace;
        let deadline = Instant::now().checked_add(grace).unwrap_or_else(Instant::now);

        // === STEP 1: Cancel and drain ===
        loop {
            let alive: Vec<CoroutineId> = {
                let mut st = self.state.lock();
                let ids: Vec<_> = st
                    .coroutines
                    .keys()
                    .copied()
                    .filter(|id| *id != self.root)
                    .collect();
                for id in &ids {
                    st.apply_cancel(*id);
                }
                ids
            };
            let now = Instant::now();
            if alive.is_empty() || now >= deadline {
                break;
            }
            let slice = (deadline - now).min(Duration::from_millis(10));
            if self.tick(Some(slice)) == Progress::Stalled {
                break;
            }
        }

        // === STEP 2: Stop the workers ===
        self.pool.shutdown();

        // === STEP 3: Destroy leftover contexts (never under the lock) ===
        let leftovers: Vec<(CoroutineId, Arc<Context>)> = {
            let st = self.state.lock();
            st.coroutines
                .iter()
                .filter(|(id, _)| **id != self.root)
                .map(|(id, slot)| (*id, slot.context.clone()))
                .collect()
        };
        if !leftovers.is_empty() {
            tracing::warn!(
                count = leftovers.len(),
                "forcing teardown of coroutines still alive after the grace period"
            );
        }
        for (id, context) in &leftovers {
            tracing::debug!(coroutine = %id, "destroying context");
            context.destroy();
        }
        drop(leftovers);

        let (unstarted, dead) = {
            let mut st = self.state.lock();
            let root = self.root;
            let ids: Vec<_> = st.coroutines.keys().copied().filter(|id| *id != root).collect();
            let unstarted: Vec<_> = ids
                .into_iter()
                .filter_map(|id| st.coroutines.remove(&id))
                .collect();
            st.stats.finished += unstarted.len() as u64;
            st.ready.clear();
            st.slot_waiters.clear();
            st.deadlines = DeadlineQueue::new();
            (unstarted, std::mem::take(&mut st.graveyard))
        };
        drop(unstarted);
        for context in dead {
            context.reap();
        }

        // === STEP 4: Check accounting ===
        let active = self.active_count();
        if active != 1 {
            tracing::error!(active, "coroutines leaked past runtime teardown");
        }
        tracing::debug!("runtime torn down");
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// A coroutine runtime bound to the thread that created it
///
/// The creating thread becomes the driver frame. Dropping the runtime
/// cancels every remaining coroutine, waits up to `shutdown_grace` for them
/// to finish, stops the worker pool and destroys anything still alive.
pub struct Runtime {
    shared: Arc<Shared>,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime on the calling thread.
    ///
    /// Fails if the thread already hosts a runtime or a coroutine, or if the
    /// worker threads cannot be started.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        if scope().is_some() {
            return Err(Error::InvalidState(
                "this thread is already running a skein runtime".into(),
            ));
        }
        let pool = WorkerPool::start(&config.pool)?;
        let (events_tx, events_rx) = channel::bounded(config.event_capacity);

        let root = CoroutineId::new();
        let mut coroutines = FxHashMap::default();
        coroutines.insert(
            root,
            CoroutineSlot::new(CoroutineState::Running, Context::root()),
        );
        let state = SchedState {
            coroutines,
            ready: VecDeque::new(),
            current: root,
            root,
            deadlines: DeadlineQueue::new(),
            graveyard: Vec::new(),
            in_flight: 0,
            slot_waiters: VecDeque::new(),
            stop_requested: false,
            stats: RuntimeStats::default(),
            next_wait_seq: 0,
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            events_tx,
            events_rx,
            pool,
            config,
            root,
            handles: AtomicUsize::new(0),
        });
        enter(Scope {
            shared: shared.clone(),
            id: root,
        });
        tracing::debug!(root = %root, "runtime started");

        Ok(Self {
            shared,
            _not_send: PhantomData,
        })
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Create a coroutine and queue it; it first runs on the next tick.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.spawn_coroutine(f)
    }

    /// Create a coroutine and run it right away, returning once it first
    /// suspends or finishes.
    pub fn go<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.shared.spawn_coroutine(f);
        self.shared.transfer(self.shared.root, handle.id(), None)?;
        Ok(handle)
    }

    /// Drive the event loop until `stop` is requested, no coroutine is left,
    /// or the remaining ones wait on nothing that can wake them.
    pub fn run(&self) -> Result<()> {
        self.shared.run()
    }

    /// Spawn `f` and drive the loop until it finishes.
    pub fn block_on<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(f).join()
    }

    /// Ask `run` to return after the current tick.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Thread-safe handle for stopping the loop and cancelling coroutines
    /// from other threads.
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle::new(&self.shared)
    }

    /// Coroutines not yet dead, including the driver frame (baseline 1).
    pub fn active_count(&self) -> usize {
        self.shared.active_count()
    }

    /// The coroutine currently holding the baton.
    pub fn current(&self) -> CoroutineHandle {
        let id = self.shared.state.lock().current;
        CoroutineHandle::new(id, &self.shared)
    }

    /// Id of the driver frame
    pub fn root_id(&self) -> CoroutineId {
        self.shared.root
    }

    /// Snapshot of the runtime counters.
    pub fn stats(&self) -> RuntimeStats {
        self.shared.state.lock().stats
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Tear the runtime down now.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.teardown();
        leave();
    }
}

/// Send + Sync control handle to a runtime
///
/// It can stop the loop and cancel coroutines from any thread. While at
/// least one handle is alive an idle loop waits for events instead of
/// returning as stalled.
pub struct RuntimeHandle {
    shared: Weak<Shared>,
}

impl RuntimeHandle {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// Ask the loop to stop. Returns false if the runtime is gone.
    pub fn stop(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.stop();
                true
            }
            None => false,
        }
    }

    /// Cancel a coroutine. Returns false if it or the runtime is gone.
    pub fn cancel(&self, id: CoroutineId) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(id),
            None => false,
        }
    }

    /// Whether the runtime still exists
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl Clone for RuntimeHandle {
    fn clone(&self) -> Self {
        match self.shared.upgrade() {
            Some(shared) => Self::new(&shared),
            None => Self {
                shared: Weak::new(),
            },
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handles.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ============================================================================
// Coroutine-context API
// ============================================================================

/// Create a coroutine on the current runtime and queue it.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match scope() {
        Some(scope) => scope.shared.spawn_coroutine(f),
        None => panic!("skein::spawn called outside a runtime"),
    }
}

/// Create a coroutine and switch into it immediately.
pub fn go<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let scope = require_scope()?;
    let handle = scope.shared.spawn_coroutine(f);
    scope.shared.transfer(scope.id, handle.id(), None)?;
    Ok(handle)
}

/// Suspend the current coroutine for `duration`.
pub fn sleep(duration: Duration) -> Result<()> {
    let scope = require_scope()?;
    match scope
        .shared
        .park(scope.id, WaitKind::Sleep, Some(duration), |_, _| Ok(()))?
    {
        Wakeup::Cancelled => Err(Error::Cancelled),
        _ => Ok(()),
    }
}

/// Let every other Ready coroutine run once before continuing.
pub fn yield_now() -> Result<()> {
    let scope = require_scope()?;
    match scope.shared.park(scope.id, WaitKind::Yield, None, |st, key| {
        st.claim(key, Wakeup::Ready);
        Ok(())
    })? {
        Wakeup::Cancelled => Err(Error::Cancelled),
        _ => Ok(()),
    }
}

/// Park until another coroutine resumes this one explicitly, returning the
/// payload it passed. `None` waits without a deadline.
pub fn suspend(timeout: Option<Duration>) -> Result<Payload> {
    let scope = require_scope()?;
    match scope
        .shared
        .park(scope.id, WaitKind::Explicit, timeout, |_, _| Ok(()))?
    {
        Wakeup::Value(payload) => Ok(payload),
        Wakeup::TimedOut => Err(Error::Timeout),
        Wakeup::Cancelled => Err(Error::Cancelled),
        Wakeup::Ready | Wakeup::Completed => Ok(Box::new(())),
    }
}

/// Consume a pending cancel request without suspending.
pub fn check_cancelled() -> Result<()> {
    let scope = require_scope()?;
    let mut st = scope.shared.state.lock();
    let pending = st
        .coroutines
        .get_mut(&scope.id)
        .is_some_and(|slot| std::mem::take(&mut slot.cancel_pending));
    if pending {
        st.stats.cancellations += 1;
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Run `f` on a worker thread as CPU work and suspend until it finishes,
/// `timeout` elapses, or the coroutine is cancelled.
pub fn submit_work<T, F>(f: F, timeout: Option<Duration>) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
{
    submit_work_kind(WorkKind::Cpu, f, timeout)
}

/// `submit_work` with an explicit work kind.
pub fn submit_work_kind<T, F>(kind: WorkKind, f: F, timeout: Option<Duration>) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
{
    let scope = require_scope()?;
    scope.shared.submit(scope.id, kind, f, timeout)
}

/// Handle to the running coroutine.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub fn current() -> CoroutineHandle {
    match try_current() {
        Some(handle) => handle,
        None => panic!("skein::current called outside a runtime"),
    }
}

/// Handle to the running coroutine, if any.
pub fn try_current() -> Option<CoroutineHandle> {
    scope().map(|scope| CoroutineHandle::new(scope.id, &scope.shared))
}

/// Coroutines alive on the current runtime, driver frame included. Zero
/// outside a runtime.
pub fn active_count() -> usize {
    scope().map_or(0, |scope| scope.shared.active_count())
}

/// Ask the current runtime's loop to stop.
pub fn stop() {
    if let Some(scope) = scope() {
        scope.shared.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn runtime() -> Runtime {
        Runtime::with_config(
            RuntimeConfig::default()
                .with_workers(2)
                .with_shutdown_grace(Duration::from_millis(200)),
        )
        .unwrap()
    }

    #[test]
    fn test_runtime_baseline() {
        let rt = runtime();
        assert_eq!(rt.active_count(), 1);
        assert_eq!(rt.current().id(), rt.root_id());
        assert_eq!(active_count(), 1);
    }

    #[test]
    fn test_second_runtime_on_thread_rejected() {
        let _rt = runtime();
        assert!(matches!(Runtime::new(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_runtime_recreated_after_drop() {
        drop(runtime());
        assert!(try_current().is_none());
        let rt = runtime();
        assert_eq!(rt.active_count(), 1);
    }

    #[test]
    fn test_spawn_runs_on_tick_in_fifo_order() {
        let rt = runtime();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            rt.spawn(move || order.lock().push(i));
        }
        assert_eq!(rt.active_count(), 4);
        rt.run().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(rt.active_count(), 1);
    }

    #[test]
    fn test_go_runs_until_first_suspend() {
        let rt = runtime();
        let marks = Arc::new(Mutex::new(Vec::new()));
        let inner = marks.clone();
        let handle = rt
            .go(move || {
                inner.lock().push("before");
                sleep(Duration::from_millis(5)).unwrap();
                inner.lock().push("after");
            })
            .unwrap();
        assert_eq!(*marks.lock(), vec!["before"]);
        assert_eq!(handle.coroutine().state(), CoroutineState::Waiting);
        rt.run().unwrap();
        assert_eq!(*marks.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_explicit_resume_delivers_payload() {
        let rt = runtime();
        let handle = rt
            .go(|| {
                let payload = suspend(None).unwrap();
                *payload.downcast::<u32>().unwrap() * 2
            })
            .unwrap();
        let outcome = handle.coroutine().resume(21u32);
        assert_eq!(outcome, ResumeOutcome::Finished);
        assert_eq!(handle.join(), Ok(42));
    }

    #[test]
    fn test_resume_dead_coroutine_is_invalid() {
        let rt = runtime();
        let handle = rt.go(|| ()).unwrap();
        let co = handle.coroutine().clone();
        assert_eq!(co.state(), CoroutineState::Dead);
        assert!(matches!(co.try_resume(()), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_resume_self_is_invalid() {
        let rt = runtime();
        let handle = rt.spawn(|| current().try_resume(()));
        rt.run().unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    #[should_panic(expected = "illegal resume")]
    fn test_resume_dead_coroutine_panics() {
        let rt = runtime();
        let handle = rt.go(|| ()).unwrap();
        handle.coroutine().resume(());
    }

    #[test]
    fn test_resume_from_foreign_thread_is_invalid() {
        let rt = runtime();
        let handle = rt.go(|| suspend(None).map(|_| ())).unwrap();
        let co = handle.coroutine().clone();
        let result = thread::spawn(move || co.try_resume(())).join().unwrap();
        assert!(matches!(result, Err(Error::InvalidState(_))));
        handle.cancel();
        rt.run().unwrap();
    }

    #[test]
    fn test_panicking_coroutine_reports_underlying() {
        let rt = runtime();
        let handle = rt.spawn(|| -> u32 { panic!("kaboom") });
        match rt.block_on(move || handle.join()).unwrap() {
            Err(Error::Underlying { message, .. }) => assert!(message.contains("kaboom")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rt.active_count(), 1);
    }

    #[test]
    fn test_pending_cancel_is_one_shot() {
        let rt = runtime();
        let handle = rt.spawn(|| {
            let first = yield_now();
            let second = yield_now();
            (first, second)
        });
        assert!(handle.cancel());
        rt.run().unwrap();
        assert!(handle.is_finished());
        let (first, second) = handle.join().unwrap();
        assert_eq!(first, Err(Error::Cancelled));
        assert_eq!(second, Ok(()));
    }

    #[test]
    fn test_check_cancelled() {
        let rt = runtime();
        let handle = rt.spawn(|| {
            let mut spins = 0u32;
            loop {
                if check_cancelled().is_err() {
                    return spins;
                }
                spins += 1;
            }
        });
        handle.cancel();
        rt.run().unwrap();
        assert_eq!(handle.join(), Ok(0));
    }

    #[test]
    fn test_driver_frame_can_sleep() {
        let rt = runtime();
        let start = Instant::now();
        sleep(Duration::from_millis(10)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_driver_frame_explicit_suspend_times_out() {
        let _rt = runtime();
        assert!(matches!(
            suspend(Some(Duration::from_millis(5))),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_stalled_driver_wait_is_cancelled() {
        let _rt = runtime();
        assert!(matches!(suspend(None), Err(Error::Cancelled)));
    }

    #[test]
    fn test_stop_from_coroutine() {
        let rt = runtime();
        rt.spawn(|| {
            stop();
        });
        let sleeper = rt.spawn(|| sleep(Duration::from_secs(30)));
        rt.run().unwrap();
        assert_eq!(sleeper.coroutine().state(), CoroutineState::Waiting);
        assert_eq!(rt.active_count(), 2);
    }

    #[test]
    fn test_teardown_cancels_sleepers() {
        let rt = runtime();
        let cleaned = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let cleaned = cleaned.clone();
            rt.spawn(move || {
                if sleep(Duration::from_secs(30)) == Err(Error::Cancelled) {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        rt.shared().tick(Some(Duration::ZERO));
        assert_eq!(rt.active_count(), 4);
        drop(rt);
        assert_eq!(cleaned.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_stats_count_resumes() {
        let rt = runtime();
        rt.spawn(|| yield_now().unwrap());
        rt.run().unwrap();
        let stats = rt.stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.resumes, 2);
    }
}
