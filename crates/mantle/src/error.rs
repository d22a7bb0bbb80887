//! Error taxonomy for the runtime.
//!
//! Configuration errors are ordinary `Result`s propagated to the creating
//! thread. Protocol violations are not recoverable — they indicate a bug in
//! the handle layer or the host — and go through [`protocol_violation`]
//! instead of this enum.

use thiserror::Error;

/// Errors raised from fallible constructors (`Domain::new`, `Region::new`,
/// the page-fault handler, the doorbell/selector wrappers).
#[derive(Debug, Error)]
pub enum MantleError {
    /// A requested CPU id does not exist on this host, or affinity could
    /// not be set for some other OS-reported reason.
    #[error("invalid CPU affinity: {0}")]
    InvalidCpuAffinity(String),

    /// The kernel doesn't support (or refused) `userfaultfd`.
    #[error("userfaultfd unavailable: {0}")]
    PageFaultHandlerUnavailable(String),

    /// A raw syscall used by the doorbell/selector/ledger failed.
    #[error("system call failed: {0}")]
    SystemCall(#[from] std::io::Error),

    /// More than one [`crate::region::Region`] was constructed on the same
    /// OS thread.
    #[error("a region is already registered on this thread")]
    RegionAlreadyBound,
}

/// Logs a protocol violation at `error` level and then aborts the process.
///
/// Protocol violations (a full message stream the caller retried into
/// anyway, a message received in a phase that doesn't expect it, binding an
/// already-bound object) are bugs in the handle layer or host, not
/// recoverable runtime conditions — the whole point of aborting instead of
/// returning a `Result` is that a corrupted barrier state machine cannot be
/// un-corrupted. In debug builds this panics (so tests can catch it); in
/// release it calls [`std::process::abort`].
#[macro_export]
macro_rules! protocol_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(%message, "protocol violation");
        if cfg!(debug_assertions) {
            panic!("protocol violation: {message}");
        } else {
            std::process::abort();
        }
    }};
}

pub use protocol_violation;
