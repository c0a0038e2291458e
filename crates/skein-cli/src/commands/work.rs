//! `skein work`: Offload a burst of blocking tasks from many coroutines.

use skein_engine::{submit_work, Error, Runtime, RuntimeConfig};
use std::thread;
use std::time::{Duration, Instant};

pub struct WorkOptions {
    pub tasks: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub timeout_ms: u64,
}

/// Spread task durations evenly over `[min_ms, max_ms]`.
fn task_duration(index: usize, tasks: usize, min_ms: u64, max_ms: u64) -> Duration {
    let (lo, hi) = (min_ms.min(max_ms), min_ms.max(max_ms));
    let step = if tasks > 1 {
        (hi - lo) * index as u64 / (tasks as u64 - 1)
    } else {
        0
    };
    Duration::from_millis(lo + step)
}

pub fn execute(config: RuntimeConfig, opts: WorkOptions) -> anyhow::Result<()> {
    let rt = Runtime::with_config(config)?;
    let timeout = (opts.timeout_ms > 0).then(|| Duration::from_millis(opts.timeout_ms));

    let start = Instant::now();
    let mut handles = Vec::with_capacity(opts.tasks);
    for index in 0..opts.tasks {
        let busy = task_duration(index, opts.tasks, opts.min_ms, opts.max_ms);
        let handle = rt.go(move || {
            submit_work(
                move |token| {
                    // Sleep in slices so an abandoned task stops early
                    let deadline = Instant::now() + busy;
                    while Instant::now() < deadline {
                        token.check()?;
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(busy)
                },
                timeout,
            )
        })?;
        handles.push(handle);
    }
    let submitted = start.elapsed();

    rt.run()?;
    let elapsed = start.elapsed();

    let (mut done, mut timed_out, mut failed) = (0usize, 0usize, 0usize);
    for handle in handles {
        match handle.join() {
            Ok(Ok(_)) => done += 1,
            Ok(Err(Error::Timeout)) => timed_out += 1,
            Ok(Err(err)) | Err(err) => {
                tracing::warn!(error = %err, "task failed");
                failed += 1;
            }
        }
    }

    let stats = rt.stats();
    tracing::info!(
        submitted = stats.work_submitted,
        completions = stats.completions,
        timeouts = stats.timeouts,
        "work run finished"
    );
    println!(
        "{} tasks: {done} done, {timed_out} timed out, {failed} failed",
        opts.tasks
    );
    println!(
        "submission took {:.2} ms, all results after {:.1} ms",
        submitted.as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}
