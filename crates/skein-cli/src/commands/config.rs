//! `skein config`: Print the resolved runtime configuration.

use skein_engine::{timeout_default, RuntimeConfig, TimeoutCategory};

pub fn execute(config: &RuntimeConfig) -> anyhow::Result<()> {
    let pool = &config.pool;
    println!("Skein v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Runtime:");
    println!("  stack_size:      {} bytes", config.stack_size);
    println!("  event_capacity:  {}", config.event_capacity);
    println!("  shutdown_grace:  {} ms", config.shutdown_grace.as_millis());
    println!();
    println!("Pool:");
    println!("  workers:         {}", pool.worker_count());
    println!("  slow_io_workers: {}", pool.slow_io_workers());
    match pool.max_pending {
        Some(pending) => println!("  max_pending:     {} ({:?} when full)", pending, pool.overflow),
        None => println!("  max_pending:     unbounded"),
    }
    println!();
    println!("Default timeouts:");
    for (name, category) in [
        ("resolve", TimeoutCategory::Resolve),
        ("accept", TimeoutCategory::Accept),
        ("connect", TimeoutCategory::Connect),
        ("read", TimeoutCategory::Read),
        ("write", TimeoutCategory::Write),
    ] {
        match timeout_default(category) {
            Some(timeout) => println!("  {:<16} {} ms", format!("{name}:"), timeout.as_millis()),
            None => println!("  {:<16} none", format!("{name}:")),
        }
    }
    Ok(())
}
