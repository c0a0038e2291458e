//! Name resolution on the worker pool.

use crate::config::{timeout_default, TimeoutCategory};
use crate::error::{Error, Result};
use crate::scheduler::{submit_work_kind, WorkKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Resolve `host:port` using the process-wide `Resolve` timeout.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    resolve_timeout(host, port, timeout_default(TimeoutCategory::Resolve))
}

/// Resolve `host:port`, giving up after `timeout` (`None` waits forever).
///
/// The lookup runs on the slow-IO lane. A lookup that times out keeps its
/// worker busy until the system resolver returns.
pub fn resolve_timeout(host: &str, port: u16, timeout: Option<Duration>) -> Result<Vec<SocketAddr>> {
    let host = host.to_string();
    submit_work_kind(
        WorkKind::SlowIo,
        move |_| {
            let addrs: Vec<SocketAddr> = (host.as_str(), port).to_socket_addrs()?.collect();
            if addrs.is_empty() {
                return Err(Error::underlying(format!("no addresses found for {host}")));
            }
            Ok(addrs)
        },
        timeout,
    )
}
