// Deadlock detection over the wait-for graph.
//
// Every blocked lock request registers edges waiter -> holder annotated with
// the lockable it is blocked on, then asks the detector to resolve. A cycle
// through the caller means deadlock; the youngest transaction in the cycle
// (highest id) is selected as victim, its interrupt flag is raised, and the
// condvar it parks on is woken. Edges never outlive the wait they describe:
// a waiter's edges are replaced on every detection call, dropped on grant,
// and dropped again when the transaction ends.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::TransactionId;

use super::lockable::{Lockable, LockableKey};

struct ParkedWaiter {
    interrupt: Arc<AtomicBool>,
    lockable: Arc<Lockable>,
}

#[derive(Default)]
struct WaitForGraph {
    /// waiter -> (holder -> lockable the waiter is blocked on).
    edges: HashMap<TransactionId, HashMap<TransactionId, LockableKey>>,
    /// Where each blocked transaction is parked, so victims on other
    /// lockables can be woken.
    parked: HashMap<TransactionId, ParkedWaiter>,
}

impl WaitForGraph {
    /// DFS from `start` back to `start`. Returns the cycle if one exists.
    fn find_cycle(&self, start: TransactionId) -> Option<Vec<TransactionId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        self.dfs(start, start, &mut visited, &mut path)
            .then_some(path)
    }

    fn dfs(
        &self,
        current: TransactionId,
        target: TransactionId,
        visited: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current);
        if let Some(targets) = self.edges.get(&current) {
            for &next in targets.keys() {
                if next == target {
                    return true;
                }
                if self.dfs(next, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }
}

/// Wait-for graph maintenance and cycle breaking.
pub struct DeadlockDetector {
    inner: Mutex<WaitForGraph>,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WaitForGraph::default()),
        }
    }

    /// Registers `waiter -> holder` edges for a blocked request on
    /// `lockable`, searches for a cycle through the waiter, and breaks it.
    ///
    /// Returns `true` iff the caller itself was selected as victim; the
    /// caller must then give up its wait and raise a deadlock error. A
    /// victim elsewhere in the cycle is interrupted and woken in place.
    ///
    /// A thread waits on exactly one lockable at a time, so any previously
    /// registered edges of this waiter belong to a finished wait and are
    /// replaced wholesale.
    pub fn add_and_resolve(
        &self,
        waiter: TransactionId,
        interrupt: &Arc<AtomicBool>,
        holders: &[TransactionId],
        lockable: &Arc<Lockable>,
    ) -> bool {
        // The interrupt delivery locks the victim's lockable, so it must
        // happen after the graph lock is released; holding both would
        // invert the lock order against blocked acquirers.
        let victim_target: Option<(Arc<AtomicBool>, Arc<Lockable>)>;
        {
            let mut inner = self.inner.lock();

            inner.parked.insert(
                waiter,
                ParkedWaiter {
                    interrupt: Arc::clone(interrupt),
                    lockable: Arc::clone(lockable),
                },
            );

            let key = lockable.key();
            let targets: HashMap<TransactionId, LockableKey> = holders
                .iter()
                .copied()
                .filter(|h| *h != waiter)
                .map(|h| (h, key))
                .collect();
            if targets.is_empty() {
                inner.edges.remove(&waiter);
                return false;
            }
            inner.edges.insert(waiter, targets);

            let cycle = match inner.find_cycle(waiter) {
                Some(cycle) => cycle,
                None => return false,
            };

            // Youngest transaction in the cycle loses.
            let victim = *cycle.iter().max().unwrap_or(&waiter);
            tracing::warn!(?cycle, victim, lockable = %key, "deadlock detected");

            inner.edges.remove(&victim);
            if victim == waiter {
                inner.parked.remove(&waiter);
                return true;
            }
            victim_target = inner
                .parked
                .get(&victim)
                .map(|parked| (Arc::clone(&parked.interrupt), Arc::clone(&parked.lockable)));
        }

        if let Some((flag, parked_on)) = victim_target {
            flag.store(true, Ordering::SeqCst);
            parked_on.notify_waiters();
        }
        false
    }

    /// Drops the waiter's edges and park registration after its request was
    /// granted or abandoned.
    pub fn waiter_done(&self, waiter: TransactionId) {
        let mut inner = self.inner.lock();
        inner.edges.remove(&waiter);
        inner.parked.remove(&waiter);
    }

    /// Drops edges pointing at `holder` for waits on `lockable`; called when
    /// the holder releases it, so stale edges cannot fake a cycle before the
    /// woken waiters refresh their own.
    pub fn holder_released(&self, holder: TransactionId, lockable: LockableKey) {
        let mut inner = self.inner.lock();
        for targets in inner.edges.values_mut() {
            if targets.get(&holder) == Some(&lockable) {
                targets.remove(&holder);
            }
        }
        inner.edges.retain(|_, targets| !targets.is_empty());
    }

    /// Removes every edge referencing a finished transaction, in either
    /// direction. No edge survives the transaction it references.
    pub fn transaction_done(&self, txn: TransactionId) {
        let mut inner = self.inner.lock();
        inner.edges.remove(&txn);
        for targets in inner.edges.values_mut() {
            targets.remove(&txn);
        }
        inner.edges.retain(|_, targets| !targets.is_empty());
        inner.parked.remove(&txn);
    }

    /// Delivers a client-initiated interrupt: raises the parked waiter's
    /// flag and wakes it. No-op if the transaction is not blocked.
    pub fn interrupt_waiter(&self, txn: TransactionId) {
        let target = {
            let inner = self.inner.lock();
            inner
                .parked
                .get(&txn)
                .map(|parked| (Arc::clone(&parked.interrupt), Arc::clone(&parked.lockable)))
        };
        if let Some((flag, parked_on)) = target {
            flag.store(true, Ordering::SeqCst);
            parked_on.notify_waiters();
        }
    }

    /// Number of wait-for edges currently registered.
    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.values().map(|t| t.len()).sum()
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("edge_count", &self.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockable() -> Arc<Lockable> {
        Lockable::root()
    }

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_no_cycle_no_victim() {
        let detector = DeadlockDetector::new();
        let l = lockable();
        assert!(!detector.add_and_resolve(1, &flag(), &[2], &l));
        assert!(!detector.add_and_resolve(2, &flag(), &[3], &l));
        assert_eq!(detector.edge_count(), 2);
    }

    #[test]
    fn test_caller_is_youngest_victim() {
        let detector = DeadlockDetector::new();
        let l = lockable();
        assert!(!detector.add_and_resolve(1, &flag(), &[5], &l));
        // 5 -> 1 closes the cycle; 5 is youngest and is the caller.
        assert!(detector.add_and_resolve(5, &flag(), &[1], &l));
    }

    #[test]
    fn test_other_victim_interrupted() {
        let detector = DeadlockDetector::new();
        let l = lockable();
        let victim_flag = flag();
        assert!(!detector.add_and_resolve(9, &victim_flag, &[2], &l));
        // 2 -> 9 closes the cycle; 9 is youngest but not the caller.
        assert!(!detector.add_and_resolve(2, &flag(), &[9], &l));
        assert!(victim_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_edges_replaced_per_wait() {
        let detector = DeadlockDetector::new();
        let l = lockable();
        detector.add_and_resolve(1, &flag(), &[2], &l);
        detector.add_and_resolve(1, &flag(), &[3], &l);
        // The edge to 2 belongs to the previous wait and is gone.
        assert_eq!(detector.edge_count(), 1);
        assert!(!detector.add_and_resolve(2, &flag(), &[1], &l));
    }

    #[test]
    fn test_transaction_done_clears_both_directions() {
        let detector = DeadlockDetector::new();
        let l = lockable();
        detector.add_and_resolve(1, &flag(), &[2], &l);
        detector.add_and_resolve(3, &flag(), &[1], &l);
        detector.transaction_done(1);
        assert_eq!(detector.edge_count(), 0);
    }
}
