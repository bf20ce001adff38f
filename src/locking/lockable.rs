// Hierarchical shared/exclusive lockables.
//
// Lockables form a tree: one root, one node per namespace, one per entity.
// Acquiring any non-root lockable first takes SHARED on its parent, so an
// EXCLUSIVE hold on a namespace shuts out every entity under it. The wait
// queue is fair: a new shared request queues behind an earlier exclusive
// waiter instead of slipping past it, and upgrades enter at the front of
// the queue.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::{EntityId, NamespaceId, TransactionId};
use crate::transaction::error::TransactionError;

use super::deadlock::DeadlockDetector;

/// Requested or held access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Identity of a lockable within the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockableKey {
    Root,
    Namespace(NamespaceId),
    Entity(EntityId),
}

impl fmt::Display for LockableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockableKey::Root => write!(f, "root"),
            LockableKey::Namespace(id) => write!(f, "namespace:{}", id),
            LockableKey::Entity(id) => write!(f, "entity:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedRequest {
    txn: TransactionId,
    #[allow(dead_code)]
    mode: LockMode,
}

#[derive(Default)]
struct LockState {
    /// Set when the single current owner holds EXCLUSIVE.
    exclusive: bool,
    /// Owners with reentry counts. Multiple owners imply SHARED.
    owners: HashMap<TransactionId, usize>,
    /// Fair wait queue. Upgrades are pushed to the front.
    queue: VecDeque<QueuedRequest>,
}

impl LockState {
    fn remove_queued(&mut self, txn: TransactionId) {
        self.queue.retain(|r| r.txn != txn);
    }

    fn others_hold(&self, txn: TransactionId) -> bool {
        self.owners.keys().any(|owner| *owner != txn)
    }

    /// Transactions ahead of `txn` in the queue (all of it if not queued).
    fn ahead_of(&self, txn: TransactionId) -> Vec<TransactionId> {
        self.queue
            .iter()
            .take_while(|r| r.txn != txn)
            .map(|r| r.txn)
            .collect()
    }
}

/// A node in the lockable hierarchy.
pub struct Lockable {
    key: LockableKey,
    parent: Option<Arc<Lockable>>,
    state: Mutex<LockState>,
    available: Condvar,
}

impl Lockable {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            key: LockableKey::Root,
            parent: None,
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
        })
    }

    pub fn child(self: &Arc<Self>, key: LockableKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            parent: Some(Arc::clone(self)),
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
        })
    }

    pub fn key(&self) -> LockableKey {
        self.key
    }

    /// Wakes every thread parked on this lockable. Used by the deadlock
    /// detector to deliver an interrupt to a victim parked here.
    ///
    /// Takes the state mutex before notifying: a waiter between its flag
    /// check and its park holds that mutex, so the notification can never
    /// fall into the gap. Callers must not hold any detector lock.
    pub fn notify_waiters(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }

    /// Acquires this lockable for `txn` in `mode`, blocking until granted or
    /// until the deadlock detector selects `txn` as victim.
    ///
    /// Reentrant: a transaction that already holds a sufficient mode only
    /// bumps its reentry count. A SHARED holder requesting EXCLUSIVE goes
    /// through the upgrade path. Fresh acquisition of a non-root lockable
    /// first takes SHARED on the parent.
    pub fn acquire(
        self: &Arc<Self>,
        txn: TransactionId,
        interrupt: &Arc<AtomicBool>,
        mode: LockMode,
        detector: &DeadlockDetector,
    ) -> Result<(), TransactionError> {
        enum Action {
            Granted,
            Upgrade,
            Fresh,
        }

        let action = {
            let mut state = self.state.lock();
            let exclusive = state.exclusive;
            match state.owners.get_mut(&txn) {
                Some(count) => {
                    if exclusive || mode == LockMode::Shared {
                        *count += 1;
                        Action::Granted
                    } else {
                        Action::Upgrade
                    }
                }
                None => Action::Fresh,
            }
        };

        match action {
            Action::Granted => return Ok(()),
            Action::Upgrade => return self.upgrade(txn, interrupt, detector),
            Action::Fresh => {}
        }

        if let Some(parent) = &self.parent {
            parent.acquire(txn, interrupt, LockMode::Shared, detector)?;
        }

        let result = self.acquire_here(txn, interrupt, mode, detector);
        if result.is_err() {
            // Give back the parent hold this attempt took.
            if let Some(parent) = &self.parent {
                parent.release(txn, detector);
            }
        }
        result
    }

    fn acquire_here(
        self: &Arc<Self>,
        txn: TransactionId,
        interrupt: &Arc<AtomicBool>,
        mode: LockMode,
        detector: &DeadlockDetector,
    ) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        let mut queued = false;
        loop {
            if interrupt.swap(false, Ordering::SeqCst) {
                state.remove_queued(txn);
                drop(state);
                detector.waiter_done(txn);
                self.notify_waiters();
                return Err(TransactionError::deadlock(txn));
            }

            if !self.blocked(&state, txn, mode, queued) {
                state.remove_queued(txn);
                state.owners.insert(txn, 1);
                if mode == LockMode::Exclusive {
                    state.exclusive = true;
                }
                drop(state);
                detector.waiter_done(txn);
                return Ok(());
            }

            if !queued {
                state.queue.push_back(QueuedRequest { txn, mode });
                queued = true;
            }

            // Waiters ahead in the queue count as holders for detection:
            // this transaction cannot proceed until they are served.
            let mut blockers: Vec<TransactionId> =
                state.owners.keys().copied().filter(|o| *o != txn).collect();
            blockers.extend(state.ahead_of(txn));

            // The detector may need to interrupt a victim parked on this
            // very lockable, which requires the state mutex. Release it for
            // the call; the loop re-evaluates everything afterwards.
            drop(state);
            if detector.add_and_resolve(txn, interrupt, &blockers, self) {
                interrupt.store(false, Ordering::SeqCst);
                let mut state = self.state.lock();
                state.remove_queued(txn);
                self.available.notify_all();
                return Err(TransactionError::deadlock(txn));
            }
            state = self.state.lock();

            // Park only if still blocked; a release during the detector
            // call already granted the way.
            if interrupt.load(Ordering::SeqCst) {
                continue;
            }
            if self.blocked(&state, txn, mode, queued) {
                self.available.wait(&mut state);
            }
        }
    }

    /// Conflict and fairness test for a fresh request.
    fn blocked(&self, state: &LockState, txn: TransactionId, mode: LockMode, queued: bool) -> bool {
        let conflicting = match mode {
            LockMode::Exclusive => state.others_hold(txn),
            LockMode::Shared => state.exclusive && state.others_hold(txn),
        };
        // Fairness: even a compatible shared request waits behind earlier
        // queued requests, so writers cannot starve.
        conflicting
            || (queued && !state.ahead_of(txn).is_empty())
            || (!queued && !state.queue.is_empty())
    }

    /// Upgrades `txn` from SHARED to EXCLUSIVE: temporarily vacates the
    /// hold, waits at the front of the queue until no other owners remain,
    /// then re-enters exclusively with the prior reentry count.
    fn upgrade(
        self: &Arc<Self>,
        txn: TransactionId,
        interrupt: &Arc<AtomicBool>,
        detector: &DeadlockDetector,
    ) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        let reentries = match state.owners.remove(&txn) {
            Some(count) => count,
            None => {
                return Err(TransactionError::internal(
                    txn,
                    "upgrade requested without a shared hold",
                ))
            }
        };
        state.queue.push_front(QueuedRequest {
            txn,
            mode: LockMode::Exclusive,
        });

        loop {
            if interrupt.swap(false, Ordering::SeqCst) {
                state.remove_queued(txn);
                state.owners.insert(txn, reentries);
                drop(state);
                detector.waiter_done(txn);
                self.notify_waiters();
                return Err(TransactionError::deadlock(txn));
            }

            if state.owners.is_empty() {
                state.remove_queued(txn);
                state.owners.insert(txn, reentries + 1);
                state.exclusive = true;
                self.available.notify_all();
                drop(state);
                detector.waiter_done(txn);
                return Ok(());
            }

            let holders: Vec<TransactionId> = state.owners.keys().copied().collect();
            drop(state);
            if detector.add_and_resolve(txn, interrupt, &holders, self) {
                interrupt.store(false, Ordering::SeqCst);
                let mut state = self.state.lock();
                state.remove_queued(txn);
                state.owners.insert(txn, reentries);
                self.available.notify_all();
                return Err(TransactionError::deadlock(txn));
            }
            state = self.state.lock();

            if interrupt.load(Ordering::SeqCst) {
                continue;
            }
            if !state.owners.is_empty() {
                self.available.wait(&mut state);
            }
        }
    }

    /// Releases one reentry of `txn`. When the count reaches zero the hold
    /// is removed, waiters are signalled, and the parent is released one
    /// level.
    pub fn release(self: &Arc<Self>, txn: TransactionId, detector: &DeadlockDetector) {
        let removed = {
            let mut state = self.state.lock();
            match state.owners.get_mut(&txn) {
                None => false,
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        state.owners.remove(&txn);
                        if state.owners.is_empty() {
                            state.exclusive = false;
                        }
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if removed {
            detector.holder_released(txn, self.key);
            self.available.notify_all();
            if let Some(parent) = &self.parent {
                parent.release(txn, detector);
            }
        }
    }

    /// Removes `txn` entirely regardless of reentry count. Used by
    /// transaction teardown.
    pub fn release_all(self: &Arc<Self>, txn: TransactionId, detector: &DeadlockDetector) {
        let removed = {
            let mut state = self.state.lock();
            state.remove_queued(txn);
            if state.owners.remove(&txn).is_some() {
                if state.owners.is_empty() {
                    state.exclusive = false;
                }
                true
            } else {
                false
            }
        };

        if removed {
            detector.holder_released(txn, self.key);
            self.available.notify_all();
            if let Some(parent) = &self.parent {
                parent.release_all(txn, detector);
            }
        }
    }

    /// True if `txn` currently owns this lockable.
    pub fn is_held_by(&self, txn: TransactionId) -> bool {
        self.state.lock().owners.contains_key(&txn)
    }

    /// True if the current hold is exclusive.
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    pub fn owner_count(&self) -> usize {
        self.state.lock().owners.len()
    }
}

impl fmt::Debug for Lockable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lockable")
            .field("key", &self.key)
            .field("exclusive", &state.exclusive)
            .field("owners", &state.owners.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}
