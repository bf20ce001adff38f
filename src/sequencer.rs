// Monotonic sequencer feeding transaction ids, snapshots, and commit
// instants. One instance per kernel; everything that needs a globally
// ordered ticket draws from the same counter, which is what makes snapshot
// and commit-instant comparisons meaningful across subsystems.

use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide monotonic ticket source.
///
/// # Contract
///
/// Consecutive calls to [`next`](Sequencer::next) yield strictly increasing,
/// distinct values, even across threads. Overflow is fatal: a kernel that
/// exhausts `i64` tickets has corrupted state no recovery can fix.
#[derive(Debug)]
pub struct Sequencer {
    current: AtomicI64,
}

impl Sequencer {
    /// Creates a sequencer whose first ticket is 1.
    pub fn new() -> Self {
        Self {
            current: AtomicI64::new(0),
        }
    }

    /// Creates a sequencer continuing after `last_issued`, used when a
    /// persisted catalog records the previous high-water mark.
    pub fn starting_after(last_issued: i64) -> Self {
        Self {
            current: AtomicI64::new(last_issued),
        }
    }

    /// Issues the next ticket.
    pub fn next(&self) -> i64 {
        let previous = self.current.fetch_add(1, Ordering::SeqCst);
        if previous == i64::MAX {
            // The counter has wrapped; every ordering guarantee is void.
            std::process::abort();
        }
        previous + 1
    }

    /// Returns the most recently issued ticket without consuming one.
    pub fn peek(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let seq = Sequencer::new();
        let a = seq.next();
        let b = seq.next();
        assert!(a < b);
        assert_eq!(seq.peek(), b);
    }

    #[test]
    fn test_distinct_across_threads() {
        let seq = Arc::new(Sequencer::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = Arc::clone(&seq);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| seq.next()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let issued = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), issued);
    }

    #[test]
    fn test_starting_after() {
        let seq = Sequencer::starting_after(41);
        assert_eq!(seq.next(), 42);
    }
}
