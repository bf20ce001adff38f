// Per-entity commit-instant log and the snapshot visibility judge.
//
// Writers stage tuples under the negative version `-T`; commit flips them to
// the positive commit instant. The log records `T -> instant` the moment the
// instant is drawn, before any flip runs, so a reader that still sees a
// staged `-T` row can interpret it correctly. That ordering is what makes
// commit atomicity observable: visibility is decided by the log alone, never
// by how far the flip has progressed.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::common::{TransactionId, VersionId};

/// Append-only map from transaction id to commit instant for one entity.
#[derive(Debug, Default)]
pub struct CommitInstantLog {
    entries: RwLock<HashMap<TransactionId, VersionId>>,
}

impl CommitInstantLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Records that `txn` committed at `instant`. Entries are never updated:
    /// a transaction commits exactly once.
    pub fn register(&self, txn: TransactionId, instant: VersionId) {
        let mut entries = self.entries.write();
        debug_assert!(!entries.contains_key(&txn));
        entries.insert(txn, instant);
    }

    /// The commit instant of `txn`, if it committed on this entity.
    pub fn instant_of(&self, txn: TransactionId) -> Option<VersionId> {
        self.entries.read().get(&txn).copied()
    }

    /// Highest commit instant recorded on this entity, or 0 if none.
    /// Write-set validation compares this against a snapshot.
    pub fn max_instant(&self) -> VersionId {
        self.entries.read().values().copied().max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Visibility predicate for one reader over one entity.
///
/// A tuple version `v` is visible iff
/// `v > 0 && v <= snapshot`, or `v == -reader`, or `v` is the staged version
/// of a transaction the log already records as committed at an instant
/// within the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct VersionJudge<'a> {
    log: &'a CommitInstantLog,
    reader: TransactionId,
    snapshot: VersionId,
}

impl<'a> VersionJudge<'a> {
    pub fn new(log: &'a CommitInstantLog, reader: TransactionId, snapshot: VersionId) -> Self {
        Self {
            log,
            reader,
            snapshot,
        }
    }

    pub fn is_visible(&self, vid: VersionId) -> bool {
        if vid > 0 {
            return vid <= self.snapshot;
        }
        if vid == 0 {
            // Reserved, never written by the kernel.
            return false;
        }
        let writer = -vid;
        if writer == self.reader {
            return true;
        }
        match self.log.instant_of(writer) {
            Some(instant) => instant <= self.snapshot,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_visibility_bounded_by_snapshot() {
        let log = CommitInstantLog::new();
        let judge = VersionJudge::new(&log, 9, 10);
        assert!(judge.is_visible(10));
        assert!(!judge.is_visible(11));
        assert!(!judge.is_visible(0));
    }

    #[test]
    fn test_own_staged_writes_visible() {
        let log = CommitInstantLog::new();
        let judge = VersionJudge::new(&log, 5, 4);
        assert!(judge.is_visible(-5));
        assert!(!judge.is_visible(-6));
    }

    #[test]
    fn test_staged_row_of_committed_writer() {
        let log = CommitInstantLog::new();
        log.register(3, 7);

        // Reader with a late snapshot sees the not-yet-flipped row.
        let late = VersionJudge::new(&log, 9, 8);
        assert!(late.is_visible(-3));

        // Reader whose snapshot predates the commit does not.
        let early = VersionJudge::new(&log, 9, 6);
        assert!(!early.is_visible(-3));
    }

    #[test]
    fn test_max_instant() {
        let log = CommitInstantLog::new();
        assert_eq!(log.max_instant(), 0);
        log.register(1, 4);
        log.register(2, 9);
        assert_eq!(log.max_instant(), 9);
        assert_eq!(log.instant_of(1), Some(4));
        assert_eq!(log.instant_of(99), None);
    }
}
