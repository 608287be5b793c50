//! # svcmux-runtime — The dispatch core
//!
//! One dispatch loop multiplexes every registered transport descriptor:
//!
//! ```text
//! loop {
//!     1. Snapshot the registry's pollable descriptors (read lock)
//!     2. Grow the wait set if the capacity changed (failure ends the loop)
//!     3. Drop descriptors whose worker still has work in flight
//!     4. Append the completion-signal descriptor
//!     5. Block in poll(2) with no timeout
//!     6. Route each ready descriptor:
//!          invalid            → kill bound worker, unregister endpoint
//!          inline class, single-threaded mode, or unknown descriptor
//!                             → serve on the dispatch thread
//!          otherwise          → hand off to the descriptor's worker
//!                               (created lazily, reused across requests)
//! }
//! ```
//!
//! Workers raise the completion signal when they finish, which wakes the
//! wait and puts their descriptor back into the next wait set. A worker is
//! long-lived: one per busy connection descriptor, parked on a channel
//! between requests, retired when its endpoint goes away.
//!
//! The loop is fully generic over the `svcmux-core` traits — registry,
//! transport, and request processor are injected, never global, so multiple
//! independent dispatchers can coexist in one process.

pub mod completion;
pub mod config;
pub mod crash;
pub mod dispatcher;
pub mod env;
pub mod registry;
pub mod table;
pub mod worker;

pub use config::{DispatchConfig, DispatchMode};
pub use dispatcher::{DispatchControl, Dispatcher};
pub use registry::SharedRegistry;
pub use table::DispatchTable;
pub use worker::{WorkerId, WorkerState};
