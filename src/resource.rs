//! Resource Coordinator - mutual exclusion for named shared resources
//!
//! Serializes access to named resources across concurrently running tasks
//! and catches deadlocks before they stall the engine. All bookkeeping
//! lives behind a single mutex; suspended acquirers park on per-request
//! oneshot channels (no polling). Release wakes the longest-waiting owner
//! with ownership transferred inside the mutex, so no third party can
//! sneak a grant in between.
//!
//! Deadlock policy: a wait-for edge is checked on insertion (incremental,
//! only nodes reachable from the new edge); on a cycle the *newest*
//! acquisition fails with Deadlock. Holders are never force-aborted.
//! Locks are non-reentrant: a second acquire by the current holder forms a
//! self wait-for edge and fails as a deadlock immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, WeftError};
use crate::event::{EventKind, EventLog};

/// Default acquisition timeout when the caller does not set one
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of one lock for introspection
#[derive(Debug, Clone)]
pub struct ResourceLockInfo {
    pub resource_id: String,
    pub owner_id: String,
    pub held_for: Duration,
    pub waiters: Vec<String>,
}

struct Waiter {
    owner: Arc<str>,
    tx: oneshot::Sender<()>,
    ticket: u64,
}

struct LockState {
    owner: Arc<str>,
    acquired_at: Instant,
    /// FIFO queue; front is the longest-waiting owner
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct CoordState {
    locks: FxHashMap<Arc<str>, LockState>,
    next_ticket: u64,
}

impl CoordState {
    /// Walk the wait-for graph (waiter -> holder edges derived from the
    /// lock table) from `start`, looking for `target`. Only the component
    /// reachable from the candidate edge is visited.
    fn reaches(&self, start: &str, target: &str) -> bool {
        if start == target {
            return true;
        }
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<&str> = vec![start];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            // Edges out of `current`: resources current is queued on
            for lock in self.locks.values() {
                if lock.waiters.iter().any(|w| w.owner.as_ref() == current) {
                    let holder = lock.owner.as_ref();
                    if holder == target {
                        return true;
                    }
                    stack.push(holder);
                }
            }
        }
        false
    }

    fn remove_waiter(&mut self, resource: &str, ticket: u64) -> bool {
        if let Some(lock) = self.locks.get_mut(resource) {
            if let Some(pos) = lock.waiters.iter().position(|w| w.ticket == ticket) {
                lock.waiters.remove(pos);
                return true;
            }
        }
        false
    }

    /// Release a held lock: hand off to the longest waiter, or drop the
    /// entry entirely when nobody is queued.
    fn release_owned(&mut self, resource: &str) -> Option<Arc<str>> {
        loop {
            let lock = self.locks.get_mut(resource)?;
            match lock.waiters.pop_front() {
                Some(next) => {
                    lock.owner = Arc::clone(&next.owner);
                    lock.acquired_at = Instant::now();
                    // A dead receiver means the waiting future was dropped;
                    // skip it and wake the next one.
                    if next.tx.send(()).is_ok() {
                        return Some(next.owner);
                    }
                }
                None => {
                    self.locks.remove(resource);
                    return None;
                }
            }
        }
    }
}

/// Coordinates exclusive access to named resources across owners.
///
/// Clone is shallow; all clones share the same lock table.
#[derive(Clone)]
pub struct ResourceCoordinator {
    state: Arc<Mutex<CoordState>>,
    event_log: EventLog,
}

impl ResourceCoordinator {
    pub fn new() -> Self {
        Self::with_event_log(EventLog::new())
    }

    /// Share the engine's event log so lock traffic lands in the same trail
    pub fn with_event_log(event_log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordState::default())),
            event_log,
        }
    }

    /// Acquire `resource_id` for `owner_id`, waiting at most `timeout`.
    ///
    /// Grants immediately when unheld. When held, suspends until granted,
    /// the timeout elapses (`ResourceTimeout`), or a deadlock implicating
    /// this wait is detected (`Deadlock`) - whichever happens first.
    pub async fn acquire(
        &self,
        resource_id: &str,
        owner_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.acquire_with_cancel(resource_id, owner_id, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`acquire`](Self::acquire), but the wait also observes a
    /// cancellation token (the engine's per-execution token).
    pub async fn acquire_with_cancel(
        &self,
        resource_id: &str,
        owner_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wait_start = Instant::now();
        let (ticket, mut rx) = {
            let mut state = self.state.lock();
            match state.locks.get(resource_id) {
                None => {
                    state.locks.insert(
                        Arc::from(resource_id),
                        LockState {
                            owner: Arc::from(owner_id),
                            acquired_at: Instant::now(),
                            waiters: VecDeque::new(),
                        },
                    );
                    debug!(resource_id, owner_id, "resource granted immediately");
                    self.event_log.emit(EventKind::ResourceAcquired {
                        resource_id: Arc::from(resource_id),
                        owner_id: Arc::from(owner_id),
                        waited_ms: 0,
                    });
                    return Ok(());
                }
                Some(lock) => {
                    // Candidate edge owner -> holder. A cycle means this
                    // request can never be granted; fail it now rather
                    // than force-aborting an older holder. The same rule
                    // rejects a re-acquire by the current holder
                    // (self-edge, non-reentrant).
                    let holder = Arc::clone(&lock.owner);
                    if holder.as_ref() == owner_id || state.reaches(&holder, owner_id) {
                        warn!(resource_id, owner_id, "deadlock detected on acquisition");
                        self.event_log.emit(EventKind::DeadlockDetected {
                            resource_id: Arc::from(resource_id),
                            owner_id: Arc::from(owner_id),
                        });
                        return Err(WeftError::Deadlock {
                            resource_id: resource_id.to_string(),
                            owner_id: owner_id.to_string(),
                        });
                    }

                    let (tx, rx) = oneshot::channel();
                    let ticket = state.next_ticket;
                    state.next_ticket += 1;
                    let lock = state.locks.get_mut(resource_id).expect("checked above");
                    lock.waiters.push_back(Waiter {
                        owner: Arc::from(owner_id),
                        tx,
                        ticket,
                    });
                    debug!(resource_id, owner_id, "queued on held resource");
                    (ticket, rx)
                }
            }
        };

        enum WaitOutcome {
            Granted,
            ChannelDropped,
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            granted = tokio::time::timeout(timeout, &mut rx) => match granted {
                Ok(Ok(())) => WaitOutcome::Granted,
                Ok(Err(_)) => WaitOutcome::ChannelDropped,
                Err(_elapsed) => WaitOutcome::TimedOut,
            },
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        match outcome {
            WaitOutcome::Granted => {
                self.event_log.emit(EventKind::ResourceAcquired {
                    resource_id: Arc::from(resource_id),
                    owner_id: Arc::from(owner_id),
                    waited_ms: wait_start.elapsed().as_millis() as u64,
                });
                Ok(())
            }
            WaitOutcome::ChannelDropped => Err(WeftError::EngineFatal {
                reason: format!("lock grant channel for '{}' dropped", resource_id),
            }),
            WaitOutcome::TimedOut => {
                self.abandon_wait(resource_id, owner_id, ticket, &mut rx);
                Err(WeftError::ResourceTimeout {
                    resource_id: resource_id.to_string(),
                    owner_id: owner_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            WaitOutcome::Cancelled => {
                self.abandon_wait(resource_id, owner_id, ticket, &mut rx);
                Err(WeftError::Cancelled)
            }
        }
    }

    /// Unlink a waiter that gave up. If the grant raced in before we took
    /// the mutex, we now own the lock and must pass it on.
    fn abandon_wait(
        &self,
        resource_id: &str,
        owner_id: &str,
        ticket: u64,
        rx: &mut oneshot::Receiver<()>,
    ) {
        let mut state = self.state.lock();
        if state.remove_waiter(resource_id, ticket) {
            return;
        }
        // Not in the queue: the grant was already sent under the mutex.
        if rx.try_recv().is_ok() {
            debug!(resource_id, owner_id, "grant raced abandonment; re-releasing");
            state.release_owned(resource_id);
        }
    }

    /// Release a held resource.
    ///
    /// Fails with `NotOwner` if the caller does not hold the lock.
    /// Ownership transfers to the longest-waiting queued owner atomically;
    /// the entry disappears when nobody is waiting.
    pub fn release(&self, resource_id: &str, owner_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.locks.get(resource_id) {
            Some(lock) if lock.owner.as_ref() == owner_id => {
                let next = state.release_owned(resource_id);
                debug!(resource_id, owner_id, next = ?next, "resource released");
                self.event_log.emit(EventKind::ResourceReleased {
                    resource_id: Arc::from(resource_id),
                    owner_id: Arc::from(owner_id),
                });
                if let Some(next_owner) = next {
                    self.event_log.emit(EventKind::ResourceAcquired {
                        resource_id: Arc::from(resource_id),
                        owner_id: next_owner,
                        waited_ms: 0,
                    });
                }
                Ok(())
            }
            _ => Err(WeftError::NotOwner {
                resource_id: resource_id.to_string(),
                owner_id: owner_id.to_string(),
            }),
        }
    }

    /// Pure deadlock pre-flight: would the given `(owner, resource)`
    /// acquisition requests, applied in order against the current lock
    /// table, produce a wait cycle? Does not block or modify any state.
    pub fn detect_deadlock(&self, pairs: &[(&str, &str)]) -> bool {
        let state = self.state.lock();

        // Hypothetical holders: live table first, then first-come claims
        let mut holders: FxHashMap<&str, &str> = state
            .locks
            .iter()
            .map(|(r, l)| (r.as_ref(), l.owner.as_ref()))
            .collect();
        // Live wait edges (waiter -> holder)
        let mut edges: Vec<(&str, &str)> = Vec::new();
        for lock in state.locks.values() {
            for w in &lock.waiters {
                edges.push((w.owner.as_ref(), lock.owner.as_ref()));
            }
        }

        for &(owner, resource) in pairs {
            match holders.get(resource) {
                None => {
                    holders.insert(resource, owner);
                }
                Some(&holder) if holder != owner => edges.push((owner, holder)),
                Some(_) => {} // already holds it in this scenario
            }
        }

        // Cycle search over the combined edge set
        let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        for &(from, to) in &edges {
            adjacency.entry(from).or_default().push(to);
        }
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        for &(start, _) in &edges {
            if visited.contains(start) {
                continue;
            }
            let mut on_path: FxHashSet<&str> = FxHashSet::default();
            if Self::cycle_from(start, &adjacency, &mut visited, &mut on_path) {
                return true;
            }
        }
        false
    }

    fn cycle_from<'a>(
        node: &'a str,
        adjacency: &FxHashMap<&'a str, Vec<&'a str>>,
        visited: &mut FxHashSet<&'a str>,
        on_path: &mut FxHashSet<&'a str>,
    ) -> bool {
        if !on_path.insert(node) {
            return true;
        }
        if visited.insert(node) {
            if let Some(children) = adjacency.get(node) {
                for &child in children {
                    if Self::cycle_from(child, adjacency, visited, on_path) {
                        return true;
                    }
                }
            }
        }
        on_path.remove(node);
        false
    }

    /// Current holder of a resource, if any
    pub fn holder(&self, resource_id: &str) -> Option<String> {
        self.state
            .lock()
            .locks
            .get(resource_id)
            .map(|l| l.owner.to_string())
    }

    /// Snapshot of all live locks
    pub fn locks(&self) -> Vec<ResourceLockInfo> {
        let state = self.state.lock();
        state
            .locks
            .iter()
            .map(|(resource, lock)| ResourceLockInfo {
                resource_id: resource.to_string(),
                owner_id: lock.owner.to_string(),
                held_for: lock.acquired_at.elapsed(),
                waiters: lock.waiters.iter().map(|w| w.owner.to_string()).collect(),
            })
            .collect()
    }
}

impl Default for ResourceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
