// Core transaction types.
//
// A `Transaction` is created by the manager, driven by its owning worker
// thread, and observed concurrently by the deadlock detector and monitoring.
// The identifier and the snapshot are immutable; the tracked sets live
// behind small mutexes.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::{AdapterId, EntityId, NamespaceId, TransactionId, VersionId};
use crate::locking::{DeadlockDetector, LockMode, Lockable};

use super::error::TransactionResult;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committing => write!(f, "COMMITTING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RollingBack => write!(f, "ROLLING_BACK"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// How the transaction came to be; maintenance work skips analyze plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFlavor {
    Interactive,
    Maintenance,
}

/// Global transaction identifier handed to adapters.
///
/// Two 64-bit halves: the global id is the kernel's process epoch, the local
/// id the transaction id. String form `GID-LID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xid {
    pub global: i64,
    pub local: i64,
}

impl Xid {
    pub fn new(global: i64, local: i64) -> Self {
        Self { global, local }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.global, self.local)
    }
}

impl FromStr for Xid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (global, local) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed xid '{}'", s))?;
        Ok(Xid {
            global: global.parse().map_err(|_| format!("bad global id in '{}'", s))?,
            local: local.parse().map_err(|_| format!("bad local id in '{}'", s))?,
        })
    }
}

/// A single transaction.
pub struct Transaction {
    id: TransactionId,
    snapshot: VersionId,
    xid: Xid,
    user: String,
    default_namespace: NamespaceId,
    flavor: TransactionFlavor,
    state: Mutex<TransactionState>,
    /// Raised by the deadlock detector on victims and by client cancel.
    interrupt: Arc<AtomicBool>,
    /// Every lockable this transaction holds, until release at end.
    locked: Mutex<Vec<Arc<Lockable>>>,
    written_entities: Mutex<HashSet<EntityId>>,
    touched_adapters: Mutex<HashSet<AdapterId>>,
    analyze: AtomicBool,
    use_cache: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        snapshot: VersionId,
        xid: Xid,
        user: impl Into<String>,
        default_namespace: NamespaceId,
        flavor: TransactionFlavor,
    ) -> Self {
        Self {
            id,
            snapshot,
            xid,
            user: user.into(),
            default_namespace,
            flavor,
            state: Mutex::new(TransactionState::Active),
            interrupt: Arc::new(AtomicBool::new(false)),
            locked: Mutex::new(Vec::new()),
            written_entities: Mutex::new(HashSet::new()),
            touched_adapters: Mutex::new(HashSet::new()),
            analyze: AtomicBool::new(true),
            use_cache: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Snapshot ticket bounding what this transaction can observe.
    pub fn snapshot(&self) -> VersionId {
        self.snapshot
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn default_namespace(&self) -> NamespaceId {
        self.default_namespace
    }

    pub fn flavor(&self) -> TransactionFlavor {
        self.flavor
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub(crate) fn transition(&self, from: TransactionState, to: TransactionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    pub(crate) fn force_state(&self, to: TransactionState) {
        *self.state.lock() = to;
    }

    pub fn interrupt_flag(&self) -> &Arc<AtomicBool> {
        &self.interrupt
    }

    /// Sets the cancel flag. The waker side lives in the manager, which
    /// knows where the transaction may be parked.
    pub fn mark_interrupted(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn set_analyze(&self, on: bool) {
        self.analyze.store(on, Ordering::Relaxed);
    }

    pub fn analyze(&self) -> bool {
        self.analyze.load(Ordering::Relaxed)
    }

    pub fn set_use_cache(&self, on: bool) {
        self.use_cache.store(on, Ordering::Relaxed);
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Relaxed)
    }

    /// Acquires `lockable` in `mode` on behalf of this transaction and
    /// remembers the hold for release at end-of-transaction.
    pub fn acquire(
        &self,
        lockable: Arc<Lockable>,
        mode: LockMode,
        detector: &DeadlockDetector,
    ) -> TransactionResult<()> {
        lockable.acquire(self.id, &self.interrupt, mode, detector)?;
        let mut locked = self.locked.lock();
        if !locked.iter().any(|held| Arc::ptr_eq(held, &lockable)) {
            locked.push(lockable);
        }
        Ok(())
    }

    /// Drops every hold. Safe to call repeatedly.
    pub(crate) fn release_all_locks(&self, detector: &DeadlockDetector) {
        let locked: Vec<Arc<Lockable>> = self.locked.lock().drain(..).collect();
        for lockable in locked {
            lockable.release_all(self.id, detector);
        }
    }

    pub fn record_write(&self, entity: EntityId) {
        self.written_entities.lock().insert(entity);
    }

    pub fn written_entities(&self) -> Vec<EntityId> {
        self.written_entities.lock().iter().copied().collect()
    }

    pub fn record_adapter(&self, adapter: AdapterId) {
        self.touched_adapters.lock().insert(adapter);
    }

    pub fn touched_adapters(&self) -> Vec<AdapterId> {
        self.touched_adapters.lock().iter().copied().collect()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("state", &self.state())
            .field("user", &self.user)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_round_trip() {
        let xid = Xid::new(77, 12);
        assert_eq!(xid.to_string(), "77-12");
        assert_eq!("77-12".parse::<Xid>().unwrap(), xid);
        assert!("garbage".parse::<Xid>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        let txn = Transaction::new(1, 1, Xid::new(0, 1), "alice", 0, TransactionFlavor::Interactive);
        assert!(txn.is_active());
        assert!(txn.transition(TransactionState::Active, TransactionState::Committing));
        assert!(!txn.transition(TransactionState::Active, TransactionState::Committing));
        assert!(!txn.state().is_terminal());
        txn.force_state(TransactionState::Committed);
        assert!(txn.state().is_terminal());
    }

    #[test]
    fn test_write_tracking() {
        let txn = Transaction::new(1, 1, Xid::new(0, 1), "alice", 0, TransactionFlavor::Interactive);
        txn.record_write(9);
        txn.record_write(9);
        assert_eq!(txn.written_entities(), vec![9]);
    }
}
