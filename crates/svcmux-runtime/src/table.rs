//! Dispatch table — descriptor ownership bookkeeping.
//!
//! The single source of truth for which worker owns a descriptor. Two maps
//! live under one lock:
//!
//! - **bindings**: descriptor → worker handle, for as long as the worker
//!   lives. Consulted by the dispatcher to find the worker for a ready
//!   descriptor.
//! - **assignments**: descriptor → worker id, only while a hand-off is in
//!   flight. A descriptor with an assignment is busy and stays out of the
//!   wait set; workers re-check their assignment before I/O to catch
//!   descriptor reuse.
//!
//! Mutations that involve a worker's state take the worker lock first and
//! the table lock second, everywhere.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use svcmux_core::registry::Pollable;

use crate::worker::{WorkerHandle, WorkerId};

struct TableInner {
    bindings: HashMap<RawFd, Arc<WorkerHandle>>,
    assignments: HashMap<RawFd, WorkerId>,
}

pub struct DispatchTable {
    inner: Mutex<TableInner>,
    next_id: AtomicU64,
    /// Bookkeeping conflicts observed (lost unbinds, foreign assignments,
    /// assignments for vanished descriptors). Diagnostic only.
    inconsistencies: AtomicU64,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                bindings: HashMap::new(),
                assignments: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            inconsistencies: AtomicU64::new(0),
        }
    }

    /// Mint a worker identity. Never reused, unlike descriptor numbers.
    pub fn allocate_id(&self) -> WorkerId {
        WorkerId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind a worker to its descriptor for the worker's lifetime.
    pub fn bind(&self, descriptor: RawFd, worker: Arc<WorkerHandle>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.bindings.insert(descriptor, worker) {
            self.inconsistencies.fetch_add(1, Ordering::Relaxed);
            warn!(
                "descriptor {} rebound while worker {} was still attached",
                descriptor,
                previous.id()
            );
        }
    }

    /// The worker bound to `descriptor`, if any.
    pub fn binding(&self, descriptor: RawFd) -> Option<Arc<WorkerHandle>> {
        self.inner.lock().unwrap().bindings.get(&descriptor).cloned()
    }

    /// Drop the binding (and any assignment) for `descriptor`, but only if
    /// it still belongs to `worker`.
    pub fn unbind(&self, descriptor: RawFd, worker: WorkerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let owned = inner
            .bindings
            .get(&descriptor)
            .map(|h| h.id() == worker)
            .unwrap_or(false);
        if owned {
            inner.bindings.remove(&descriptor);
            if inner.assignments.get(&descriptor) == Some(&worker) {
                inner.assignments.remove(&descriptor);
            }
        }
        owned
    }

    /// Record an in-flight hand-off.
    ///
    /// A live assignment for a *different* worker indicates a lost release
    /// somewhere; it is logged and left untouched rather than clobbered.
    pub fn assign(&self, descriptor: RawFd, worker: WorkerId) {
        let mut inner = self.inner.lock().unwrap();
        match inner.assignments.get(&descriptor) {
            Some(&current) if current != worker => {
                self.inconsistencies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "descriptor {} already assigned to worker {}, dropping assignment for worker {}",
                    descriptor, current, worker
                );
            }
            Some(_) => {}
            None => {
                inner.assignments.insert(descriptor, worker);
            }
        }
    }

    /// Clear the assignment for `descriptor`, but only on an exact
    /// (descriptor, worker) match, so a stale release can never clobber a
    /// newer valid assignment. Returns whether anything was cleared.
    pub fn release(&self, descriptor: RawFd, worker: WorkerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.assignments.get(&descriptor) {
            Some(&current) if current == worker => {
                inner.assignments.remove(&descriptor);
                true
            }
            _ => false,
        }
    }

    /// The worker currently assigned to `descriptor`, if any.
    pub fn assignee(&self, descriptor: RawFd) -> Option<WorkerId> {
        self.inner.lock().unwrap().assignments.get(&descriptor).copied()
    }

    /// Reconcile the assignments against the registry's current pollable
    /// snapshot. Returns the busy descriptors to exclude from the wait set;
    /// assignments whose descriptor is no longer pollable are logged (the
    /// registry dropped an endpoint whose worker was never unbound) but the
    /// loop goes on.
    pub fn reconcile(&self, snapshot: &[Pollable]) -> HashSet<RawFd> {
        let current: HashSet<RawFd> = snapshot.iter().map(|p| p.descriptor).collect();
        let inner = self.inner.lock().unwrap();
        let mut busy = HashSet::with_capacity(inner.assignments.len());
        for (&descriptor, &worker) in &inner.assignments {
            if current.contains(&descriptor) {
                busy.insert(descriptor);
            } else {
                self.inconsistencies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "assignment for descriptor {} (worker {}) has no pollable endpoint",
                    descriptor, worker
                );
            }
        }
        busy
    }

    /// Take every binding, clearing the table. The caller retires the
    /// returned workers.
    pub fn drain(&self) -> Vec<Arc<WorkerHandle>> {
        let mut inner = self.inner.lock().unwrap();
        inner.assignments.clear();
        inner.bindings.drain().map(|(_, handle)| handle).collect()
    }

    pub fn bound_len(&self) -> usize {
        self.inner.lock().unwrap().bindings.len()
    }

    pub fn assigned_len(&self) -> usize {
        self.inner.lock().unwrap().assignments.len()
    }

    pub fn inconsistency_count(&self) -> u64 {
        self.inconsistencies.load(Ordering::Relaxed)
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}
