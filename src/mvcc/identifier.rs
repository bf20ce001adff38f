// Per-entity allocator of stable tuple identifiers.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::common::EntryId;

/// Issues `_eid` values for one entity.
///
/// Identifiers are never re-issued for the lifetime of the registry;
/// reclaiming ids of vacuumed tuples is a maintenance concern outside the
/// kernel. Allocation is a single atomic reservation, so concurrent inserts
/// on the same entity never collide.
#[derive(Debug)]
pub struct EntryIdentifierRegistry {
    next: AtomicI64,
}

impl EntryIdentifierRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Continues allocation after a persisted high-water mark.
    pub fn starting_after(last_issued: EntryId) -> Self {
        Self {
            next: AtomicI64::new(last_issued + 1),
        }
    }

    /// Reserves `n` fresh identifiers and returns them in issue order.
    pub fn allocate(&self, n: usize) -> Vec<EntryId> {
        let first = self.next.fetch_add(n as i64, Ordering::SeqCst);
        (first..first + n as i64).collect()
    }

    /// Reserves a single identifier.
    pub fn allocate_one(&self) -> EntryId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest identifier issued so far, or 0 if none.
    pub fn high_water_mark(&self) -> EntryId {
        self.next.load(Ordering::SeqCst) - 1
    }
}

impl Default for EntryIdentifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocate_batch() {
        let registry = EntryIdentifierRegistry::new();
        let ids = registry.allocate(3);
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.allocate_one(), 4);
        assert_eq!(registry.high_water_mark(), 4);
    }

    #[test]
    fn test_concurrent_inserts_never_collide() {
        let registry = Arc::new(EntryIdentifierRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                for _ in 0..200 {
                    mine.extend(registry.allocate(3));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "identifier {} issued twice", id);
            }
        }
        assert_eq!(seen.len(), 4 * 200 * 3);
    }
}
