//! Request processing abstraction.
//!
//! A `RequestProcessor` serves one ready descriptor: receive, decode,
//! application-level dispatch, reply. The dispatch core treats the whole
//! unit as opaque.

use std::os::unix::io::RawFd;

/// Serves one ready descriptor as a bounded synchronous unit.
///
/// **Contract:**
/// - `process()` is invoked from the dispatch thread (inline service) or
///   from a worker thread (threaded service), but never concurrently for
///   the same descriptor.
/// - It must return in bounded time; it may block on request I/O but not
///   park indefinitely.
/// - Request-level failures are the processor's own responsibility to
///   surface to the peer. The return value only says whether anything
///   actionable was found on the descriptor.
pub trait RequestProcessor: Send + Sync {
    /// Serve whatever is pending on `descriptor`. Returns `true` if at
    /// least one request was handled.
    fn process(&self, descriptor: RawFd) -> bool;
}
