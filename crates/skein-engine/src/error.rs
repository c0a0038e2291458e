//! Engine error types.
//!
//! Suspend-point failures (`Timeout`, `Cancelled`, `Underlying`) are ordinary
//! values handed back to the waiting coroutine. `InvalidState` marks a broken
//! scheduling contract and is only returned by the fallible `try_*` APIs; the
//! plain variants panic instead.

/// Errors produced by the coroutine runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The deadline armed for a suspend point fired first
    #[error("operation timed out")]
    Timeout,

    /// The waiting coroutine was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// An OS call or offloaded callable failed
    #[error("{message}")]
    Underlying {
        /// OS error number, when the failure came from the OS
        code: Option<i32>,
        /// Human readable description
        message: String,
    },

    /// A scheduling contract was violated (e.g. resuming a dead coroutine)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The worker pool is at capacity and does not queue
    #[error("worker pool exhausted")]
    PoolExhausted,

    /// The worker pool has been shut down
    #[error("worker pool is shut down")]
    PoolShutdown,
}

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an `Underlying` error without an OS code.
    pub fn underlying(message: impl Into<String>) -> Self {
        Error::Underlying {
            code: None,
            message: message.into(),
        }
    }

    /// Errno-style code for wrapper layers that report numeric errors.
    #[cfg(unix)]
    pub fn code(&self) -> i32 {
        match self {
            Error::Timeout => libc::ETIMEDOUT,
            Error::Cancelled => libc::ECANCELED,
            Error::Underlying { code, .. } => code.unwrap_or(libc::EIO),
            Error::InvalidState(_) => libc::EINVAL,
            Error::PoolExhausted => libc::EAGAIN,
            Error::PoolShutdown => libc::ESHUTDOWN,
        }
    }

    /// Errno-style code for wrapper layers that report numeric errors.
    #[cfg(not(unix))]
    pub fn code(&self) -> i32 {
        match self {
            Error::Timeout => 110,
            Error::Cancelled => 125,
            Error::Underlying { code, .. } => code.unwrap_or(5),
            Error::InvalidState(_) => 22,
            Error::PoolExhausted => 11,
            Error::PoolShutdown => 108,
        }
    }

    /// True for `Timeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Underlying {
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// Render a caught panic payload for an `Underlying` error.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
