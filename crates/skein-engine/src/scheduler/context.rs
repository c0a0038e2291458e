//! Execution contexts
//!
//! A context owns the stack a coroutine runs on. Contexts are backed by
//! dedicated OS threads that stay parked on a condition variable unless they
//! hold the baton, so exactly one context on a runtime executes at a time and
//! every switch is synchronous: `switch` hands the baton to the target and
//! blocks until someone hands it back.
//!
//! The thread is created lazily on the first switch into the context.
//! `destroy` tears down a parked context by waking it with an exit signal,
//! which unwinds the coroutine's stack back to its entry.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Unwind payload used to tear down a parked context.
pub(crate) struct ContextExit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Resume,
    Exit,
}

/// One-slot signal a parked context waits on
struct Baton {
    signal: Mutex<Option<Transfer>>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            signal: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn post(&self, transfer: Transfer) {
        let mut signal = self.signal.lock();
        *signal = Some(transfer);
        self.cv.notify_one();
    }

    fn wait(&self) -> Transfer {
        let mut signal = self.signal.lock();
        loop {
            if let Some(transfer) = signal.take() {
                return transfer;
            }
            self.cv.wait(&mut signal);
        }
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Exclusively owned control-transfer context
pub(crate) struct Context {
    name: String,
    stack_size: usize,
    baton: Arc<Baton>,
    /// Entry point, present until the backing thread is started
    entry: Mutex<Option<Entry>>,
    /// Backing thread (None for the driver's root context)
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Context {
    /// Context for the thread that drives the event loop. It never spawns.
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            name: "skein-root".to_string(),
            stack_size: 0,
            baton: Arc::new(Baton::new()),
            entry: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    /// Create a context that will run `entry` on a stack of `stack_size` bytes.
    pub(crate) fn new(name: String, stack_size: usize, entry: Entry) -> Arc<Self> {
        Arc::new(Self {
            name,
            stack_size,
            baton: Arc::new(Baton::new()),
            entry: Mutex::new(Some(entry)),
            thread: Mutex::new(None),
        })
    }

    /// Start the backing thread if it is not running yet. The thread parks
    /// until the first `switch` into it.
    pub(crate) fn start(&self) -> std::io::Result<()> {
        let mut entry = self.entry.lock();
        let Some(body) = entry.take() else {
            return Ok(());
        };
        // The thread takes the body out of this slot, so a failed spawn can
        // put it back.
        let pending = Arc::new(Mutex::new(Some(body)));
        let thread_body = pending.clone();
        let baton = self.baton.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .stack_size(self.stack_size)
            .spawn(move || {
                if baton.wait() == Transfer::Exit {
                    return;
                }
                let body = thread_body.lock().take();
                if let Some(body) = body {
                    body();
                }
            });
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                *entry = pending.lock().take();
                Err(err)
            }
        }
    }

    /// Whether the backing thread has been created
    #[cfg(test)]
    pub(crate) fn is_started(&self) -> bool {
        self.entry.lock().is_none()
    }

    /// Hand control from `from` (the calling context) to `to` and park until
    /// control comes back. `to` must already be started.
    pub(crate) fn switch(from: &Context, to: &Context) {
        to.baton.post(Transfer::Resume);
        from.park();
    }

    /// Hand control to `to` without parking. Used by a context whose entry
    /// has returned.
    pub(crate) fn hand_off(to: &Context) {
        to.baton.post(Transfer::Resume);
    }

    fn park(&self) {
        if self.baton.wait() == Transfer::Exit {
            std::panic::resume_unwind(Box::new(ContextExit));
        }
    }

    /// Release the context. A parked thread is woken with an exit signal and
    /// unwinds; a context that never started just drops its entry. Blocks
    /// until the backing thread is gone.
    pub(crate) fn destroy(&self) {
        drop(self.entry.lock().take());
        if let Some(handle) = self.take_foreign_handle() {
            if !handle.is_finished() {
                self.baton.post(Transfer::Exit);
            }
            let _ = handle.join();
        }
    }

    /// Join the backing thread of a context whose entry already returned.
    pub(crate) fn reap(&self) {
        if let Some(handle) = self.take_foreign_handle() {
            let _ = handle.join();
        }
    }

    /// Take the join handle unless the caller is the backing thread itself.
    fn take_foreign_handle(&self) -> Option<JoinHandle<()>> {
        let mut slot = self.thread.lock();
        let own = slot
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id());
        if own {
            None
        } else {
            slot.take()
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}
