// Multi-version concurrency control state.
//
// Each modifiable entity in an MVCC namespace owns exactly one identifier
// registry and one commit-instant log. `MvccState` is their single home;
// get-or-create keeps the one-per-entity invariant without any registration
// ceremony at DDL time.

pub mod commit_log;
pub mod identifier;

pub use commit_log::{CommitInstantLog, VersionJudge};
pub use identifier::EntryIdentifierRegistry;

use dashmap::DashMap;
use std::sync::Arc;

use crate::common::EntityId;

/// Per-entity MVCC bookkeeping for one kernel.
#[derive(Debug, Default)]
pub struct MvccState {
    registries: DashMap<EntityId, Arc<EntryIdentifierRegistry>>,
    commit_logs: DashMap<EntityId, Arc<CommitInstantLog>>,
}

impl MvccState {
    pub fn new() -> Self {
        Self {
            registries: DashMap::new(),
            commit_logs: DashMap::new(),
        }
    }

    /// The identifier registry of `entity`, created on first use.
    pub fn registry(&self, entity: EntityId) -> Arc<EntryIdentifierRegistry> {
        self.registries
            .entry(entity)
            .or_insert_with(|| Arc::new(EntryIdentifierRegistry::new()))
            .clone()
    }

    /// The commit-instant log of `entity`, created on first use.
    pub fn commit_log(&self, entity: EntityId) -> Arc<CommitInstantLog> {
        self.commit_logs
            .entry(entity)
            .or_insert_with(|| Arc::new(CommitInstantLog::new()))
            .clone()
    }

    /// Drops the bookkeeping of a dropped entity.
    pub fn forget(&self, entity: EntityId) {
        self.registries.remove(&entity);
        self.commit_logs.remove(&entity);
    }
}
