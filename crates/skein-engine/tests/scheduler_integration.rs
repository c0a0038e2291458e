//! Scheduler Integration Tests
//!
//! End-to-end behaviour of the coroutine scheduler through the public API:
//! - Dispatch order and deadline ordering
//! - Explicit resume, nested `go` and caller return
//! - Joining, join timeouts
//! - Cancellation from coroutines and from foreign threads
//! - Active-count accounting across run and teardown
//!
//! # Running Tests
//! ```bash
//! cargo test --test scheduler_integration
//! ```

use parking_lot::Mutex;
use skein_engine::scheduler::DeadlineQueue;
use skein_engine::{
    active_count, current, go, sleep, spawn, suspend, yield_now, CoroutineState, Error,
    ResumeOutcome, Runtime, RuntimeConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime() -> Runtime {
    Runtime::with_config(
        RuntimeConfig::default()
            .with_workers(2)
            .with_shutdown_grace(Duration::from_millis(200)),
    )
    .unwrap()
}

// ===== Ordering =====

#[test]
fn test_sleepers_wake_in_deadline_order() {
    let rt = runtime();
    let woke = Arc::new(Mutex::new(Vec::new()));

    // Spawned longest-first so spawn order and deadline order disagree
    for ms in [40u64, 30, 20, 10] {
        let woke = woke.clone();
        rt.spawn(move || {
            sleep(Duration::from_millis(ms)).unwrap();
            woke.lock().push(ms);
        });
    }
    rt.run().unwrap();

    assert_eq!(*woke.lock(), vec![10, 20, 30, 40]);
}

#[test]
fn test_yield_interleaves_coroutines() {
    let rt = runtime();
    let trace = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b"] {
        let trace = trace.clone();
        rt.spawn(move || {
            for i in 0..3 {
                trace.lock().push(format!("{name}{i}"));
                yield_now().unwrap();
            }
        });
    }
    rt.run().unwrap();
    assert_eq!(*trace.lock(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
}

#[test]
fn test_deadline_queue_cancel_after_fire_keeps_later_entry() {
    let mut queue = DeadlineQueue::new();
    let now = Instant::now();
    let first = queue.arm(now, "co");
    assert_eq!(queue.pop_due(now).len(), 1);
    let second = queue.arm(now + Duration::from_millis(1), "co");

    assert!(!queue.cancel(first));
    assert!(queue.is_armed(second));
    assert_eq!(queue.len(), 1);
}

// ===== Resume =====

#[test]
fn test_nested_go_returns_to_caller() {
    let rt = runtime();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let outer_trace = trace.clone();
    let outer = rt
        .go(move || {
            outer_trace.lock().push("outer start");
            let inner_trace = outer_trace.clone();
            let inner = go(move || {
                inner_trace.lock().push("inner start");
                suspend(None).unwrap();
                inner_trace.lock().push("inner resumed");
            })
            .unwrap();
            // Inner suspended; control is back here, not in the driver
            outer_trace.lock().push("outer continues");
            assert_eq!(inner.coroutine().resume(()), ResumeOutcome::Finished);
            outer_trace.lock().push("outer end");
        })
        .unwrap();
    assert!(outer.is_finished());
    assert_eq!(
        *trace.lock(),
        vec![
            "outer start",
            "inner start",
            "outer continues",
            "inner resumed",
            "outer end"
        ]
    );
}

#[test]
fn test_resume_running_caller_is_invalid() {
    let rt = runtime();
    let result = rt.block_on(|| {
        let parent = current();
        let child = go(move || parent.try_resume(())).unwrap();
        child.join()
    });
    // The parent is waiting on the child it resumed
    assert!(matches!(result, Ok(Ok(Err(Error::InvalidState(_))))));
}

#[test]
fn test_suspend_timeout_without_resume() {
    let rt = runtime();
    let handle = rt.spawn(|| suspend(Some(Duration::from_millis(5))).map(|_| ()));
    rt.run().unwrap();
    assert_eq!(handle.join(), Ok(Err(Error::Timeout)));
}

// ===== Join =====

#[test]
fn test_join_waits_for_result() {
    let rt = runtime();
    let value = rt
        .block_on(|| {
            let worker = spawn(|| {
                sleep(Duration::from_millis(5)).unwrap();
                "done"
            });
            worker.join()
        })
        .unwrap();
    assert_eq!(value, Ok("done"));
}

#[test]
fn test_join_timeout_keeps_handle_usable() {
    let rt = runtime();
    let outcome = rt
        .block_on(|| {
            let mut slow = spawn(|| {
                sleep(Duration::from_millis(30)).unwrap();
                7
            });
            let first = slow.join_timeout(Duration::from_millis(1));
            let second = slow.join_timeout(Duration::from_secs(5));
            (first, second)
        })
        .unwrap();
    assert_eq!(outcome, (Err(Error::Timeout), Ok(7)));
}

#[test]
fn test_join_self_is_invalid() {
    let rt = runtime();
    let slot: Arc<Mutex<Option<skein_engine::JoinHandle<()>>>> = Arc::new(Mutex::new(None));
    let inner_slot = slot.clone();
    let handle = rt.spawn(move || {
        let me = inner_slot.lock().take();
        if let Some(me) = me {
            assert!(matches!(me.join(), Err(Error::InvalidState(_))));
        }
    });
    *slot.lock() = Some(handle);
    rt.run().unwrap();
    assert_eq!(rt.active_count(), 1);
}

// ===== Cancellation =====

#[test]
fn test_cancel_sleeping_coroutine() {
    let rt = runtime();
    let sleeper = rt.spawn(|| sleep(Duration::from_secs(30)));
    let target = sleeper.coroutine().clone();
    rt.spawn(move || {
        sleep(Duration::from_millis(5)).unwrap();
        assert!(target.cancel());
    });
    let start = Instant::now();
    rt.run().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(sleeper.join(), Ok(Err(Error::Cancelled)));
}

#[test]
fn test_cancelled_coroutine_can_clean_up() {
    let rt = runtime();
    let cleaned = Arc::new(AtomicUsize::new(0));
    let flag = cleaned.clone();
    let handle = rt.spawn(move || {
        if sleep(Duration::from_secs(30)).is_err() {
            // Suspending again after the cancel is allowed
            sleep(Duration::from_millis(1)).unwrap();
            flag.fetch_add(1, Ordering::SeqCst);
        }
    });
    rt.spawn({
        let target = handle.coroutine().clone();
        move || {
            yield_now().unwrap();
            target.cancel();
        }
    });
    rt.run().unwrap();
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_overrides_undelivered_timeout() {
    let rt = runtime();
    let waiter = rt.spawn(|| suspend(Some(Duration::from_millis(3))).map(|_| ()));
    let target = waiter.coroutine().clone();
    // Runs ahead of the waiter in every tick, so it sees the timeout before
    // the waiter does
    rt.spawn(move || loop {
        match target.state() {
            CoroutineState::Ready => {
                assert!(target.cancel());
                return;
            }
            CoroutineState::Dead => return,
            _ => yield_now().unwrap(),
        }
    });
    rt.run().unwrap();

    assert_eq!(waiter.join(), Ok(Err(Error::Cancelled)));
    let stats = rt.stats();
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.cancellations, 1);
}

#[test]
fn test_cancel_from_foreign_thread() {
    let rt = runtime();
    let handle = rt.handle();
    let sleeper = rt.spawn(|| sleep(Duration::from_secs(30)));
    let id = sleeper.id();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.cancel(id)
    });
    let start = Instant::now();
    rt.run().unwrap();
    assert!(canceller.join().unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(sleeper.join(), Ok(Err(Error::Cancelled)));
}

#[test]
fn test_stop_from_foreign_thread() {
    let rt = runtime();
    let handle = rt.handle();
    let sleeper = rt.spawn(|| sleep(Duration::from_secs(30)));

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.stop()
    });
    let start = Instant::now();
    rt.run().unwrap();
    assert!(stopper.join().unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(sleeper.coroutine().state(), CoroutineState::Waiting);
}

#[test]
fn test_handle_outlives_runtime() {
    let rt = runtime();
    let handle = rt.handle();
    assert!(handle.is_alive());
    drop(rt);
    assert!(!handle.is_alive());
    assert!(!handle.stop());
}

// ===== Accounting =====

#[test]
fn test_active_count_returns_to_baseline() {
    let rt = runtime();
    assert_eq!(rt.active_count(), 1);
    for i in 0..20u64 {
        rt.spawn(move || {
            sleep(Duration::from_millis(i % 5)).unwrap();
            assert!(active_count() >= 2);
        });
    }
    assert_eq!(rt.active_count(), 21);
    rt.run().unwrap();
    assert_eq!(rt.active_count(), 1);

    let stats = rt.stats();
    assert_eq!(stats.spawned, 20);
    assert_eq!(stats.finished, 20);
}

#[test]
fn test_every_suspend_resumes_exactly_once() {
    let rt = runtime();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..30u64 {
        let outcomes = outcomes.clone();
        handles.push(rt.spawn(move || {
            let result = sleep(Duration::from_millis(i % 7));
            outcomes.lock().push((i, result));
        }));
    }
    // Cancel every third sleeper while they race their timers
    let targets: Vec<_> = handles
        .iter()
        .step_by(3)
        .map(|h| h.coroutine().clone())
        .collect();
    rt.spawn(move || {
        sleep(Duration::from_millis(2)).unwrap();
        for target in targets {
            target.cancel();
        }
    });
    rt.run().unwrap();

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 30);
    let mut seen: Vec<u64> = outcomes.iter().map(|(i, _)| *i).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 30);
    for (_, result) in outcomes.iter() {
        assert!(matches!(result, Ok(()) | Err(Error::Cancelled)));
    }
    assert_eq!(rt.active_count(), 1);
}

#[test]
fn test_teardown_destroys_unresponsive_coroutines() {
    let rt = Runtime::with_config(
        RuntimeConfig::default()
            .with_workers(1)
            .with_shutdown_grace(Duration::from_millis(20)),
    )
    .unwrap();
    let dropped = Arc::new(AtomicUsize::new(0));

    struct Guard(Arc<AtomicUsize>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let guard = Guard(dropped.clone());
    rt.spawn(move || {
        let _guard = guard;
        // Ignores cancellation
        loop {
            let _ = sleep(Duration::from_millis(5));
        }
    });
    // Drive the loop long enough for the coroutine to start
    let _ = rt.block_on(|| sleep(Duration::from_millis(10)));
    drop(rt);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}
