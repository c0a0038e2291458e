//! `skein sleep`: Park many coroutines on timers at once.

use skein_engine::{sleep, Runtime, RuntimeConfig};
use std::time::{Duration, Instant};

pub fn execute(config: RuntimeConfig, coroutines: usize, ms: u64) -> anyhow::Result<()> {
    let rt = Runtime::with_config(config)?;
    let duration = Duration::from_millis(ms);

    let start = Instant::now();
    let handles: Vec<_> = (0..coroutines)
        .map(|_| rt.spawn(move || sleep(duration)))
        .collect();
    rt.run()?;
    let elapsed = start.elapsed();

    let mut woke = 0usize;
    for handle in handles {
        if matches!(handle.join(), Ok(Ok(()))) {
            woke += 1;
        }
    }

    let stats = rt.stats();
    tracing::info!(coroutines, woke, resumes = stats.resumes, "sleep run finished");
    println!(
        "{woke}/{coroutines} coroutines slept {ms} ms, wall time {:.1} ms",
        elapsed.as_secs_f64() * 1000.0
    );
    anyhow::ensure!(rt.active_count() == 1, "coroutines leaked: {}", rt.active_count() - 1);
    Ok(())
}
