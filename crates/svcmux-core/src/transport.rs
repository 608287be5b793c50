//! Transport endpoint abstraction.
//!
//! A `Transport` is one bidirectional channel through which requests arrive
//! and replies are sent — a connected stream socket, a datagram socket
//! multiplexing many peers, or a listener producing new connections. The
//! dispatch core only ever sees the descriptor, the class, and the status;
//! the byte-level operations are for the request processor's use.
//!
//! The original capability set of this style of server also carries explicit
//! get-arguments / free-arguments / destroy operations. Those are subsumed
//! by ownership here: `receive` yields an owned frame, and dropping the last
//! handle after unregistration destroys the endpoint.

use std::os::unix::io::RawFd;

/// What a transport reports about itself after I/O activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportStatus {
    /// The peer is gone; the endpoint should be unregistered.
    Dead = 0,

    /// More complete requests are already buffered.
    MoreInput = 1,

    /// Nothing further to read right now.
    Idle = 2,
}

impl TransportStatus {
    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, TransportStatus::Dead)
    }

    #[inline]
    pub const fn has_more(&self) -> bool {
        matches!(self, TransportStatus::MoreInput)
    }
}

/// Endpoint kind, which decides how a ready descriptor is served.
///
/// Only `Connection` endpoints ever get a dedicated worker. Connectionless
/// endpoints multiplex every peer over one descriptor — parallel service
/// would interleave partial requests — and rendezvous endpoints only accept,
/// which is short and already serialized by the listener itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportClass {
    /// A connected stream endpoint serving one peer.
    Connection = 0,

    /// A connectionless endpoint multiplexing all peers on one descriptor.
    Connectionless = 1,

    /// A listening endpoint whose only job is producing connections.
    Rendezvous = 2,
}

impl TransportClass {
    /// Whether a ready descriptor of this class is handed to a dedicated
    /// worker in multi-threaded mode. Everything else is served inline on
    /// the dispatch thread.
    #[inline]
    pub const fn dedicated_worker(&self) -> bool {
        matches!(self, TransportClass::Connection)
    }
}

/// One transport endpoint.
///
/// **Contract:**
/// - `descriptor()` is stable for the lifetime of the registration.
/// - `receive()` returns `true` when a complete request frame was decoded
///   into `frame`; it must not block indefinitely on a readable descriptor.
/// - `reply()` sends one reply frame; delivery failure is the transport's
///   problem to surface via `status()`.
/// - Implementations are shared between the dispatch thread and workers and
///   must synchronize their own I/O state internally.
pub trait Transport: Send + Sync {
    /// The pollable descriptor identifying this endpoint.
    fn descriptor(&self) -> RawFd;

    /// Endpoint kind (see [`TransportClass::dedicated_worker`]).
    fn class(&self) -> TransportClass;

    /// Current endpoint status.
    fn status(&self) -> TransportStatus;

    /// Read one complete request frame into `frame`.
    ///
    /// Returns `false` when no complete request is available (partial input
    /// is buffered internally) or the endpoint is dead.
    fn receive(&self, frame: &mut Vec<u8>) -> bool;

    /// Send one reply frame. Returns `false` if the reply could not be sent.
    fn reply(&self, frame: &[u8]) -> bool;

    /// Catch-all control operation. Unknown requests return `false`.
    fn control(&self, request: u32, argument: &mut [u8]) -> bool {
        let _ = (request, argument);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        assert!(TransportStatus::Dead.is_dead());
        assert!(!TransportStatus::Idle.is_dead());
        assert!(TransportStatus::MoreInput.has_more());
        assert!(!TransportStatus::Dead.has_more());
    }

    #[test]
    fn test_only_connections_get_workers() {
        assert!(TransportClass::Connection.dedicated_worker());
        assert!(!TransportClass::Connectionless.dedicated_worker());
        assert!(!TransportClass::Rendezvous.dedicated_worker());
    }
}
