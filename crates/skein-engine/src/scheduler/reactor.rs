//! Event loop driver
//!
//! One `tick` reaps finished contexts, drains the cross-thread event queue,
//! fires due deadlines, dispatches the Ready coroutines that were queued when
//! the tick started, and finally blocks until the next deadline or event if
//! nothing is runnable. Only the driver frame (the root) runs ticks.

use crate::scheduler::coroutine::{CoroutineId, CoroutineState};
use crate::scheduler::pool::WorkId;
use crate::scheduler::scheduler::Shared;
use crate::scheduler::wait::{WaitKey, Wakeup};
use crossbeam::channel::RecvTimeoutError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Messages posted to the scheduler thread from other threads
#[derive(Debug)]
pub(crate) enum Event {
    /// A worker stored the result of a work task
    WorkDone { key: WaitKey, work: WorkId },
    /// Cancel request from a `RuntimeHandle`
    Cancel(CoroutineId),
    /// Stop request from a `RuntimeHandle`
    Stop,
}

/// Result of one driver iteration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Something ran or may still happen
    Continue,
    /// Nothing is runnable and nothing can ever wake a waiter
    Stalled,
}

impl Shared {
    /// Run one driver iteration. `max_wait` caps how long an idle tick
    /// blocks; `None` blocks until the next deadline or event.
    pub(crate) fn tick(self: &Arc<Self>, max_wait: Option<Duration>) -> Progress {
        let mut progressed = false;

        // === STEP 1: Join contexts whose entry returned ===
        let dead = std::mem::take(&mut self.state.lock().graveyard);
        for context in dead {
            context.reap();
        }

        // === STEP 2: Drain cross-thread events ===
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            progressed = true;
        }

        // === STEP 3: Fire due deadlines (earliest first) ===
        {
            let mut st = self.state.lock();
            let due = st.deadlines.pop_due(Instant::now());
            progressed |= !due.is_empty();
            for (_, key) in due {
                st.fire_timer(key);
            }
        }

        // === STEP 4: Dispatch coroutines that were Ready at tick start ===
        let batch = self.state.lock().ready.len();
        for _ in 0..batch {
            let next = {
                let mut st = self.state.lock();
                match st.ready.pop_front() {
                    Some(id) if st.state_of(id) == CoroutineState::Ready => Some(id),
                    Some(_) => continue,
                    None => None,
                }
            };
            let Some(id) = next else { break };
            progressed = true;
            if let Err(err) = self.transfer(self.root, id, None) {
                tracing::warn!(coroutine = %id, error = %err, "failed to dispatch coroutine");
            }
        }

        // === STEP 5: Block until the next deadline or event ===
        let (next_deadline, in_flight) = {
            let mut st = self.state.lock();
            let (root_woken, root_parked) = st
                .coroutines
                .get(&self.root)
                .map_or((false, false), |slot| (slot.wake.is_some(), slot.wait.is_some()));
            let stopping = st.stop_requested && !root_parked;
            if progressed || !st.ready.is_empty() || root_woken || stopping {
                return Progress::Continue;
            }
            (st.deadlines.next_deadline(), st.in_flight)
        };

        let now = Instant::now();
        let until_deadline = next_deadline.map(|d| d.saturating_duration_since(now));
        let wait = match (until_deadline, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let event = match wait {
            Some(wait) => match self.events_rx.recv_timeout(wait) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Progress::Continue,
                Err(RecvTimeoutError::Disconnected) => return Progress::Stalled,
            },
            None if in_flight > 0 || self.handles.load(Ordering::Acquire) > 0 => {
                match self.events_rx.recv() {
                    Ok(event) => event,
                    Err(_) => return Progress::Stalled,
                }
            }
            None => return Progress::Stalled,
        };
        self.handle_event(event);
        Progress::Continue
    }

    fn handle_event(&self, event: Event) {
        let mut st = self.state.lock();
        match event {
            Event::WorkDone { key, work } => {
                st.in_flight = st.in_flight.saturating_sub(1);
                st.wake_slot_waiter();
                if !st.claim(key, Wakeup::Completed) {
                    tracing::trace!(%work, coroutine = %key.coroutine, "late work result discarded");
                }
            }
            Event::Cancel(id) => {
                st.apply_cancel(id);
            }
            Event::Stop => st.stop_requested = true,
        }
    }
}
