//! The dispatch loop.
//!
//! `Dispatcher::run()` owns the decision of *who* serves a ready
//! descriptor. Each iteration rebuilds the wait set from the registry,
//! subtracts descriptors whose workers are still busy, blocks in poll(2),
//! and routes every ready descriptor either inline or to its worker.
//!
//! The loop ends two ways, and the return value tells them apart: `Ok(())`
//! when the pollable set went empty (orderly stop), `Err(_)` when the wait
//! itself failed or the wait set could not be grown.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::panic;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use svcmux_core::error::{DispatchError, Result};
use svcmux_core::processor::RequestProcessor;
use svcmux_core::registry::{Interest, TransportRegistry};

use crate::completion::CompletionSignal;
use crate::config::{DispatchConfig, DispatchMode};
use crate::table::DispatchTable;
use crate::worker::{self, WorkerHandle};

fn poll_events(interest: Interest) -> PollFlags {
    let mut events = PollFlags::empty();
    if interest.contains(Interest::READ) {
        events |= PollFlags::POLLIN;
    }
    if interest.contains(Interest::WRITE) {
        events |= PollFlags::POLLOUT;
    }
    events
}

/// Handle for requesting orderly shutdown from another thread.
///
/// `stop()` clears the registry's pollable set and wakes the parked wait;
/// the loop observes the empty snapshot and returns `Ok(())`.
pub struct DispatchControl {
    registry: Arc<dyn TransportRegistry>,
    signal: Arc<CompletionSignal>,
}

impl Clone for DispatchControl {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            signal: Arc::clone(&self.signal),
        }
    }
}

impl DispatchControl {
    pub fn stop(&self) {
        self.registry.clear();
        self.signal.raise();
    }
}

/// The dispatch scheduler.
pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<dyn TransportRegistry>,
    processor: Arc<dyn RequestProcessor>,
    table: Arc<DispatchTable>,
    signal: Arc<CompletionSignal>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        registry: Arc<dyn TransportRegistry>,
        processor: Arc<dyn RequestProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            processor,
            table: Arc::new(DispatchTable::new()),
            signal: Arc::new(CompletionSignal::new()?),
        })
    }

    /// Descriptor ownership bookkeeping, exposed for introspection.
    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// A shutdown handle usable from any thread.
    pub fn control(&self) -> DispatchControl {
        DispatchControl {
            registry: Arc::clone(&self.registry),
            signal: Arc::clone(&self.signal),
        }
    }

    /// Change the service mode. Only meaningful between runs; `&mut self`
    /// keeps it impossible while the loop is live.
    pub fn set_mode(&mut self, mode: DispatchMode) {
        self.config.mode = mode;
    }

    /// Run the dispatch loop until the pollable set is empty or a fatal
    /// error occurs. Blocks the calling thread for the duration.
    pub fn run(&mut self) -> Result<()> {
        let mut wait_set: Vec<PollFd<'static>> = Vec::new();
        let mut wait_fds: Vec<RawFd> = Vec::new();

        let outcome = loop {
            // Snapshot the registry; an empty pollable set is the stop
            // condition.
            let snapshot = self.registry.pollable();
            if snapshot.is_empty() {
                debug!("pollable set empty, dispatch loop ending");
                break Ok(());
            }

            wait_set.clear();
            wait_fds.clear();
            let needed = snapshot.len() + 1;
            if let Err(err) = wait_set.try_reserve(needed) {
                error!("cannot grow wait set to {} entries: {}", needed, err);
                break Err(DispatchError::WaitSetExhausted);
            }
            if let Err(err) = wait_fds.try_reserve(needed) {
                error!("cannot grow wait set to {} entries: {}", needed, err);
                break Err(DispatchError::WaitSetExhausted);
            }

            // Busy descriptors stay out: a descriptor is never both in the
            // wait set and assigned to a working worker.
            let busy = self.table.reconcile(&snapshot);
            for entry in &snapshot {
                if busy.contains(&entry.descriptor) {
                    continue;
                }
                // Safety: the descriptor is a point-in-time snapshot. If it
                // is closed before or during the wait, poll reports
                // POLLNVAL and route() unregisters it.
                let fd = unsafe { BorrowedFd::borrow_raw(entry.descriptor) };
                wait_set.push(PollFd::new(fd, poll_events(entry.interest)));
                wait_fds.push(entry.descriptor);
            }

            // The completion signal is always the last wait-set entry.
            // Safety: the signal descriptor lives as long as self.
            let control = unsafe { BorrowedFd::borrow_raw(self.signal.descriptor()) };
            wait_set.push(PollFd::new(control, PollFlags::POLLIN));
            wait_fds.push(self.signal.descriptor());

            let ready = match poll(&mut wait_set, PollTimeout::NONE) {
                Ok(0) => continue, // spurious wake
                Ok(n) => n as usize,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!("readiness wait failed: {}", errno);
                    break Err(DispatchError::WaitFailed(errno as i32));
                }
            };

            let mut found = 0;
            for (index, entry) in wait_set.iter().enumerate() {
                let revents = entry.revents().unwrap_or_else(PollFlags::empty);
                if revents.is_empty() {
                    continue;
                }
                self.route(wait_fds[index], revents);
                found += 1;
                if found >= ready {
                    break;
                }
            }
        };

        self.teardown();
        outcome
    }

    /// `run()` behind a recovery boundary: a panic escaping the loop is
    /// reported (the installed hook logs the backtrace) and surfaced as a
    /// fatal loop exit instead of tearing the thread down.
    pub fn run_supervised(&mut self) -> Result<()> {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| self.run())) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("dispatch loop panicked");
                self.teardown();
                Err(DispatchError::Panicked)
            }
        }
    }

    /// Route one ready descriptor.
    fn route(&self, descriptor: RawFd, revents: PollFlags) {
        if descriptor == self.signal.descriptor() {
            trace!("completion signal drained: {}", self.signal.drain());
            return;
        }

        if revents.contains(PollFlags::POLLNVAL) {
            // The descriptor went away under us — closed by the peer path
            // or recycled. Retire the worker and drop the endpoint.
            warn!("descriptor {} invalid in wait set, unregistering", descriptor);
            if let Some(handle) = self.table.binding(descriptor) {
                handle.offer_kill();
                self.table.unbind(descriptor, handle.id());
            }
            self.registry.unregister(descriptor);
            return;
        }

        let transport = self.registry.lookup(descriptor);
        let threaded = match (self.config.mode, &transport) {
            (DispatchMode::SingleThreaded, _) => false,
            // Unknown descriptors and inline classes are served on the
            // dispatch thread; a worker buys nothing for them.
            (_, None) => false,
            (_, Some(t)) => t.class().dedicated_worker(),
        };

        if threaded {
            self.hand_off(descriptor);
        } else {
            let handled = self.processor.process(descriptor);
            trace!("descriptor {} served inline, handled={}", descriptor, handled);
        }
    }

    /// Hand a ready connection descriptor to its worker, creating and
    /// binding one on first use.
    fn hand_off(&self, descriptor: RawFd) {
        let handle = match self.table.binding(descriptor) {
            Some(handle) => handle,
            None => match self.spawn_bound(descriptor) {
                Some(handle) => handle,
                None => {
                    // Could not get a worker; serving inline is still
                    // correct, just unparallel.
                    self.processor.process(descriptor);
                    return;
                }
            },
        };

        if handle.offer_pending(&self.table) {
            return;
        }

        // The worker retired on its own (stale binding or kill); rebind.
        warn!(
            "worker {} for descriptor {} is gone, rebinding",
            handle.id(),
            descriptor
        );
        self.table.unbind(descriptor, handle.id());
        match self.spawn_bound(descriptor) {
            Some(fresh) => {
                if !fresh.offer_pending(&self.table) {
                    warn!("fresh worker for descriptor {} refused hand-off", descriptor);
                }
            }
            None => {
                self.processor.process(descriptor);
            }
        }
    }

    fn spawn_bound(&self, descriptor: RawFd) -> Option<Arc<WorkerHandle>> {
        match worker::spawn(
            descriptor,
            &self.table,
            &self.signal,
            &self.processor,
            self.config.worker_stack,
        ) {
            Ok(handle) => {
                self.table.bind(descriptor, Arc::clone(&handle));
                Some(handle)
            }
            Err(err) => {
                warn!("worker spawn for descriptor {} failed: {}", descriptor, err);
                None
            }
        }
    }

    /// Retire every bound worker. Runs on every loop exit so no worker
    /// outlives the loop bound into the table.
    fn teardown(&self) {
        let bound = self.table.drain();
        for handle in &bound {
            handle.offer_kill();
        }
        if !bound.is_empty() {
            debug!("retired {} workers on loop exit", bound.len());
        }
    }
}
