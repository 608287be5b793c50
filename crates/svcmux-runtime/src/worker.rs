//! Per-descriptor worker execution contexts.
//!
//! A worker is a detached OS thread bound to one connection descriptor. It
//! parks on a channel between requests and is reused across every request
//! that arrives on its descriptor, so the thread-creation cost is paid once
//! per connection rather than once per request.
//!
//! State machine (transitions under the worker's own lock):
//!
//! ```text
//! Idle ──offer──▶ Pending ──wake──▶ WorkInProgress ──done──▶ Idle
//!   │                │                    │
//!   └────kill────────┴───────kill─────────┘──▶ Kill (terminal)
//! ```
//!
//! The dispatcher only ever offers `Pending` or `Kill`. A worker observes
//! `Kill` at its next checkpoint — on wake, or after finishing the current
//! request — and exits without raising the completion signal. Lock order is
//! worker-lock → table-lock wherever both are held.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::panic;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};

use svcmux_core::processor::RequestProcessor;

use crate::completion::CompletionSignal;
use crate::table::DispatchTable;

/// Unique identity of one worker.
///
/// Descriptor numbers are recycled by the OS; worker ids never are. The
/// assignment table stores ids so a worker can tell whether an assignment
/// still names *it* or a successor bound after a descriptor was reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        WorkerId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Parked, waiting for a hand-off.
    Idle = 0,

    /// Hand-off received, not yet picked up.
    Pending = 1,

    /// Serving a request right now.
    WorkInProgress = 2,

    /// Retirement requested; terminal.
    Kill = 3,
}

impl WorkerState {
    /// A busy worker's descriptor must stay out of the wait set.
    #[inline]
    pub const fn is_busy(&self) -> bool {
        matches!(self, WorkerState::Pending | WorkerState::WorkInProgress)
    }

    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Kill)
    }
}

/// What the dispatcher sends a parked worker.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Directive {
    /// A descriptor readiness event was handed over.
    Run,
    /// Retire.
    Kill,
}

/// Shared side of one worker: the dispatcher holds this, the thread holds
/// the receiving end of the directive channel.
pub struct WorkerHandle {
    id: WorkerId,
    descriptor: RawFd,
    state: Mutex<WorkerState>,
    directives: Sender<Directive>,
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, descriptor: RawFd, directives: Sender<Directive>) -> Self {
        Self {
            id,
            descriptor,
            state: Mutex::new(WorkerState::Idle),
            directives,
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    /// Hand a readiness event to this worker.
    ///
    /// Returns `false` when nothing could be delivered — the worker already
    /// retired (terminal state or closed channel) and the caller should
    /// rebind the descriptor to a fresh worker.
    pub(crate) fn offer_pending(&self, table: &DispatchTable) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            WorkerState::Kill => false,
            WorkerState::Idle => {
                table.assign(self.descriptor, self.id);
                if self.directives.send(Directive::Run).is_err() {
                    table.release(self.descriptor, self.id);
                    return false;
                }
                *state = WorkerState::Pending;
                true
            }
            // Already registered and woken; nothing further to do.
            WorkerState::Pending => true,
            WorkerState::WorkInProgress => {
                // Recorded for the worker's next checkpoint. The assignment
                // stays in place so the descriptor remains excluded from
                // the wait set until the extra round is served.
                table.assign(self.descriptor, self.id);
                if self.directives.send(Directive::Run).is_err() {
                    return false;
                }
                *state = WorkerState::Pending;
                true
            }
        }
    }

    /// Request retirement. Observed by the worker at its next checkpoint.
    pub(crate) fn offer_kill(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            WorkerState::Kill => {
                // Wake it, just in case it never saw the first request.
                let _ = self.directives.send(Directive::Kill);
            }
            WorkerState::Idle => {
                *state = WorkerState::Kill;
                let _ = self.directives.send(Directive::Kill);
            }
            // A wake is already queued (Pending) or the worker is running
            // (WorkInProgress); the state is enough.
            WorkerState::Pending | WorkerState::WorkInProgress => {
                *state = WorkerState::Kill;
            }
        }
    }
}

/// Everything the worker thread owns.
struct WorkerContext {
    handle: Arc<WorkerHandle>,
    directives: Receiver<Directive>,
    table: Arc<DispatchTable>,
    signal: Arc<CompletionSignal>,
    processor: Arc<dyn RequestProcessor>,
}

/// Spawn a detached worker for `descriptor`.
///
/// The join handle is dropped on purpose: retirement is driven through
/// `offer_kill`, never through joins, so a retiring worker can outlive the
/// dispatch iteration that killed it without anyone blocking on it.
pub(crate) fn spawn(
    descriptor: RawFd,
    table: &Arc<DispatchTable>,
    signal: &Arc<CompletionSignal>,
    processor: &Arc<dyn RequestProcessor>,
    stack: usize,
) -> io::Result<Arc<WorkerHandle>> {
    let id = table.allocate_id();
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = Arc::new(WorkerHandle::new(id, descriptor, tx));

    let ctx = WorkerContext {
        handle: Arc::clone(&handle),
        directives: rx,
        table: Arc::clone(table),
        signal: Arc::clone(signal),
        processor: Arc::clone(processor),
    };

    let mut builder = thread::Builder::new().name(format!("svcmux-worker-{}", descriptor));
    if stack > 0 {
        builder = builder.stack_size(stack);
    }
    builder.spawn(move || worker_loop(ctx))?;
    Ok(handle)
}

/// Worker thread main loop.
fn worker_loop(ctx: WorkerContext) {
    let WorkerContext {
        handle,
        directives,
        table,
        signal,
        processor,
    } = ctx;
    let descriptor = handle.descriptor;
    let id = handle.id;
    debug!("worker {} bound to descriptor {}", id, descriptor);

    loop {
        // Park until the dispatcher hands something over. A closed channel
        // means the dispatcher is gone; treat it like Kill.
        match directives.recv() {
            Ok(Directive::Run) => {}
            Ok(Directive::Kill) | Err(_) => {
                table.release(descriptor, id);
                break;
            }
        }

        {
            let mut state = handle.state.lock().unwrap();
            if *state == WorkerState::Kill {
                table.release(descriptor, id);
                break;
            }
            *state = WorkerState::WorkInProgress;
        }

        // Stale-binding check: descriptor numbers are recycled, so before
        // any I/O the assignment must still name this worker.
        match table.assignee(descriptor) {
            Some(owner) if owner == id => {}
            Some(owner) => {
                warn!(
                    "descriptor {} now assigned to worker {}, not worker {}; retiring",
                    descriptor, owner, id
                );
                break;
            }
            None => {
                warn!(
                    "descriptor {} has no assignment for worker {}; retiring",
                    descriptor, id
                );
                break;
            }
        }

        if panic::catch_unwind(panic::AssertUnwindSafe(|| processor.process(descriptor))).is_err()
        {
            error!(
                "request processor panicked on descriptor {}; connection state is suspect",
                descriptor
            );
        }

        // Checkpoint: release the descriptor unless more work or a kill
        // arrived while we were busy.
        let mut state = handle.state.lock().unwrap();
        match *state {
            WorkerState::Kill => {
                table.release(descriptor, id);
                break;
            }
            WorkerState::Pending => {
                // Re-offered while busy: keep the assignment, skip the
                // completion signal, serve the queued round.
                drop(state);
                continue;
            }
            _ => {
                if !table.release(descriptor, id) {
                    warn!(
                        "assignment for descriptor {} vanished while worker {} was busy",
                        descriptor, id
                    );
                }
                *state = WorkerState::Idle;
                drop(state);
                // Release happens before the raise, so the dispatcher can
                // only re-admit the descriptor after we are off it.
                signal.raise();
            }
        }
    }

    debug!("worker {} for descriptor {} exiting", id, descriptor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    struct CountingProcessor {
        calls: AtomicUsize,
    }

    impl CountingProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RequestProcessor for CountingProcessor {
        fn process(&self, _descriptor: RawFd) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    /// Processor that parks until told to finish.
    struct GatedProcessor {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl RequestProcessor for GatedProcessor {
        fn process(&self, _descriptor: RawFd) -> bool {
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
            true
        }
    }

    fn detached_handle(state: WorkerState) -> (WorkerHandle, Receiver<Directive>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = WorkerHandle::new(WorkerId::new(7), 42, tx);
        *handle.state.lock().unwrap() = state;
        (handle, rx)
    }

    #[test]
    fn test_state_helpers() {
        assert!(WorkerState::Pending.is_busy());
        assert!(WorkerState::WorkInProgress.is_busy());
        assert!(!WorkerState::Idle.is_busy());
        assert!(!WorkerState::Kill.is_busy());
        assert!(WorkerState::Kill.is_terminal());
        assert!(!WorkerState::Pending.is_terminal());
    }

    #[test]
    fn test_offer_pending_is_idempotent() {
        let table = DispatchTable::new();
        let (handle, rx) = detached_handle(WorkerState::Idle);

        assert!(handle.offer_pending(&table));
        assert!(handle.offer_pending(&table));
        assert!(handle.offer_pending(&table));

        // One wake, one assignment, state Pending.
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(table.assignee(42), Some(WorkerId::new(7)));
        assert_eq!(table.assigned_len(), 1);
        assert_eq!(handle.state(), WorkerState::Pending);
    }

    #[test]
    fn test_kill_is_terminal() {
        let table = DispatchTable::new();
        let (handle, rx) = detached_handle(WorkerState::Idle);

        handle.offer_kill();
        assert_eq!(handle.state(), WorkerState::Kill);

        // Pending never re-enters after Kill, and nothing gets assigned.
        assert!(!handle.offer_pending(&table));
        assert_eq!(handle.state(), WorkerState::Kill);
        assert_eq!(table.assigned_len(), 0);
        assert_eq!(rx.try_iter().count(), 1); // the single Kill wake
    }

    #[test]
    fn test_offer_while_busy_is_recorded() {
        let table = DispatchTable::new();
        let (handle, rx) = detached_handle(WorkerState::WorkInProgress);
        table.assign(42, WorkerId::new(7));

        assert!(handle.offer_pending(&table));
        assert_eq!(handle.state(), WorkerState::Pending);
        // Still a single assignment, plus a queued wake for the checkpoint.
        assert_eq!(table.assigned_len(), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_worker_serves_and_signals_completion() {
        let table = Arc::new(DispatchTable::new());
        let signal = Arc::new(CompletionSignal::new().unwrap());
        let processor = CountingProcessor::new();

        let handle = spawn(
            42,
            &table,
            &signal,
            &(Arc::clone(&processor) as Arc<dyn RequestProcessor>),
            0,
        )
        .unwrap();

        assert!(handle.offer_pending(&table));
        assert!(wait_until(|| processor.calls() == 1));
        assert!(wait_until(|| handle.state() == WorkerState::Idle));

        // Assignment released before the completion signal was raised.
        assert_eq!(table.assigned_len(), 0);
        assert!(signal.drain() > 0);

        // Reused for a second request without respawning.
        assert!(handle.offer_pending(&table));
        assert!(wait_until(|| processor.calls() == 2));
    }

    #[test]
    fn test_stale_binding_aborts_without_processing() {
        let table = Arc::new(DispatchTable::new());
        let signal = Arc::new(CompletionSignal::new().unwrap());
        let processor = CountingProcessor::new();

        // Somebody else already owns descriptor 42.
        table.assign(42, WorkerId::new(9999));

        let handle = spawn(
            42,
            &table,
            &signal,
            &(Arc::clone(&processor) as Arc<dyn RequestProcessor>),
            0,
        )
        .unwrap();

        handle.offer_pending(&table);

        // The worker wakes, finds the foreign assignment, and retires
        // without touching the processor or the foreign entry.
        assert!(wait_until(|| !handle.offer_pending(&table)));
        assert_eq!(processor.calls(), 0);
        assert_eq!(table.assignee(42), Some(WorkerId::new(9999)));
        assert_eq!(signal.drain(), 0);
    }

    #[test]
    fn test_kill_during_work_skips_completion_signal() {
        let table = Arc::new(DispatchTable::new());
        let signal = Arc::new(CompletionSignal::new().unwrap());
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let processor: Arc<dyn RequestProcessor> = Arc::new(GatedProcessor {
            entered: entered_tx,
            release: release_rx,
        });

        let handle = spawn(42, &table, &signal, &processor, 0).unwrap();
        assert!(handle.offer_pending(&table));

        // Wait for the worker to be inside the processor, then kill it.
        entered_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("worker never started processing");
        handle.offer_kill();
        release_tx.send(()).unwrap();

        assert!(wait_until(|| table.assigned_len() == 0));
        // The retiring worker must not raise the completion signal.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(signal.drain(), 0);
        assert_eq!(handle.state(), WorkerState::Kill);
    }

    #[test]
    fn test_idle_kill_retires_worker() {
        let table = Arc::new(DispatchTable::new());
        let signal = Arc::new(CompletionSignal::new().unwrap());
        let processor = CountingProcessor::new();

        let handle = spawn(
            42,
            &table,
            &signal,
            &(Arc::clone(&processor) as Arc<dyn RequestProcessor>),
            0,
        )
        .unwrap();

        handle.offer_kill();
        // Once the thread is gone the channel reports disconnected.
        assert!(wait_until(|| !handle.offer_pending(&table)));
        assert_eq!(processor.calls(), 0);
    }
}
