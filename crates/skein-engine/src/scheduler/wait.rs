//! Suspend / resume / cancel protocol
//!
//! Every suspend point registers a `PendingWait` on the coroutine's slot and
//! gets back a `WaitKey`. Whoever wants to wake the coroutine (a timer, a
//! worker completion, a cancel request, an explicit resume) must `claim` that
//! key. Only the first claim finds the pending wait; it removes the wait,
//! disarms its timer, records the outcome in the resume slot and makes the
//! coroutine `Ready`. Every later claim for the same key is a no-op, which is
//! what makes each suspend point resume exactly once.

use crate::scheduler::coroutine::{CoroutineId, CoroutineState, Payload};
use crate::scheduler::pool::WorkState;
use crate::scheduler::scheduler::SchedState;
use crate::scheduler::timer::TimerHandle;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies one suspend point of one coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct WaitKey {
    pub(crate) coroutine: CoroutineId,
    pub(crate) seq: u64,
}

/// What a suspended coroutine is waiting on
pub(crate) enum WaitKind {
    /// `sleep`: the deadline firing is the completion
    Sleep,
    /// `yield_now`: claimed as soon as it is armed
    Yield,
    /// `suspend`: woken by an explicit resume carrying a payload
    Explicit,
    /// An offloaded work task
    Work(Arc<WorkState>),
    /// A free in-flight slot in a bounded worker pool
    PoolSlot,
    /// Another coroutine finishing
    Join(CoroutineId),
}

impl fmt::Debug for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKind::Sleep => f.write_str("Sleep"),
            WaitKind::Yield => f.write_str("Yield"),
            WaitKind::Explicit => f.write_str("Explicit"),
            WaitKind::Work(state) => write!(f, "Work({})", state.id()),
            WaitKind::PoolSlot => f.write_str("PoolSlot"),
            WaitKind::Join(id) => write!(f, "Join({id})"),
        }
    }
}

/// Registered suspend point
#[derive(Debug)]
pub(crate) struct PendingWait {
    pub(crate) key: WaitKey,
    pub(crate) kind: WaitKind,
    pub(crate) timer: Option<TimerHandle>,
}

/// Outcome delivered through the resume slot
pub(crate) enum Wakeup {
    /// The awaited condition happened (sleep elapsed, slot freed, join target died)
    Ready,
    /// The offloaded work finished; its result sits in the task
    Completed,
    /// Explicit resume payload
    Value(Payload),
    /// The deadline fired first
    TimedOut,
    /// Cancellation won the race
    Cancelled,
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Wakeup::Ready => "Ready",
            Wakeup::Completed => "Completed",
            Wakeup::Value(_) => "Value",
            Wakeup::TimedOut => "TimedOut",
            Wakeup::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl SchedState {
    /// Register a suspend point for `id` and arm its deadline.
    pub(crate) fn begin_wait(
        &mut self,
        id: CoroutineId,
        kind: WaitKind,
        timeout: Option<Duration>,
    ) -> WaitKey {
        self.next_wait_seq += 1;
        let key = WaitKey {
            coroutine: id,
            seq: self.next_wait_seq,
        };
        let timer = timeout
            .and_then(|d| Instant::now().checked_add(d))
            .map(|deadline| self.deadlines.arm(deadline, key));
        if let Some(slot) = self.coroutines.get_mut(&id) {
            slot.wait = Some(PendingWait { key, kind, timer });
            slot.wake = None;
            slot.state = CoroutineState::Waiting;
        }
        key
    }

    /// Undo `begin_wait` when arming the underlying operation failed.
    pub(crate) fn abort_wait(&mut self, key: WaitKey) {
        let timer = match self.coroutines.get_mut(&key.coroutine) {
            Some(slot) if slot.wait.as_ref().is_some_and(|w| w.key == key) => {
                slot.state = CoroutineState::Running;
                slot.wait.take().and_then(|w| w.timer)
            }
            _ => None,
        };
        if let Some(timer) = timer {
            self.deadlines.cancel(timer);
        }
    }

    /// Resolve the wait identified by `key` with `wake`. Returns false when the
    /// wait was already resolved by someone else.
    pub(crate) fn claim(&mut self, key: WaitKey, wake: Wakeup) -> bool {
        let wait = match self.coroutines.get_mut(&key.coroutine) {
            Some(slot) if slot.wait.as_ref().is_some_and(|w| w.key == key) => slot.wait.take(),
            _ => None,
        };
        let Some(wait) = wait else {
            return false;
        };

        if let Some(timer) = wait.timer {
            self.deadlines.cancel(timer);
        }
        let aborted = matches!(wake, Wakeup::TimedOut | Wakeup::Cancelled);
        match &wait.kind {
            WaitKind::Work(work) if aborted => work.token().cancel(),
            WaitKind::PoolSlot => self.slot_waiters.retain(|k| *k != key),
            _ => {}
        }

        match wake {
            Wakeup::TimedOut => self.stats.timeouts += 1,
            Wakeup::Cancelled => self.stats.cancellations += 1,
            Wakeup::Completed => self.stats.completions += 1,
            _ => {}
        }
        tracing::trace!(coroutine = %key.coroutine, wait = ?wait.kind, outcome = ?wake, "wait resolved");

        if let Some(slot) = self.coroutines.get_mut(&key.coroutine) {
            slot.wake = Some(wake);
            slot.state = CoroutineState::Ready;
        }
        if key.coroutine != self.root {
            self.ready.push_back(key.coroutine);
        }
        true
    }

    /// A deadline armed for `key` fired.
    pub(crate) fn fire_timer(&mut self, key: WaitKey) {
        let wake = match self.coroutines.get(&key.coroutine).and_then(|s| s.wait.as_ref()) {
            Some(wait) if wait.key == key => match &wait.kind {
                WaitKind::Sleep => Wakeup::Ready,
                // Completion wins a same-tick race: its event is already queued
                WaitKind::Work(work) if work.is_finished() => return,
                _ => Wakeup::TimedOut,
            },
            _ => return,
        };
        if matches!(wake, Wakeup::TimedOut) {
            tracing::debug!(coroutine = %key.coroutine, "suspend point timed out");
        }
        self.claim(key, wake);
    }

    /// Apply a cancel request to `id`.
    ///
    /// A parked coroutine has its wait resolved as `Cancelled` (unless its work
    /// already finished). A Ready coroutine whose undelivered outcome is a
    /// timeout gets `Cancelled` instead. Anything else remembers the request
    /// for the coroutine's next suspend point.
    pub(crate) fn apply_cancel(&mut self, id: CoroutineId) -> bool {
        let Some(slot) = self.coroutines.get_mut(&id) else {
            return false;
        };
        if slot.state == CoroutineState::Dead {
            return false;
        }
        if let Some(wait) = &slot.wait {
            if let WaitKind::Work(work) = &wait.kind {
                if work.is_finished() {
                    return false;
                }
            }
            let key = wait.key;
            return self.claim(key, Wakeup::Cancelled);
        }
        if slot.state == CoroutineState::Ready && matches!(slot.wake, Some(Wakeup::TimedOut)) {
            slot.wake = Some(Wakeup::Cancelled);
            self.stats.timeouts = self.stats.timeouts.saturating_sub(1);
            self.stats.cancellations += 1;
            return true;
        }
        slot.cancel_pending = true;
        true
    }

    /// Wake the oldest coroutine waiting for a pool slot.
    pub(crate) fn wake_slot_waiter(&mut self) {
        while let Some(key) = self.slot_waiters.pop_front() {
            if self.claim(key, Wakeup::Ready) {
                break;
            }
        }
    }
}
