// Hierarchical lock manager.
//
// `Lockables` is the single source of truth for mutual exclusion on entity
// data: one root lockable, one per namespace under it, one per entity under
// its namespace. The deadlock detector lives alongside because every wait
// registers with it.

pub mod deadlock;
pub mod lockable;

pub use deadlock::DeadlockDetector;
pub use lockable::{LockMode, Lockable, LockableKey};

use dashmap::DashMap;
use std::sync::Arc;

use crate::common::{EntityId, NamespaceId};

/// Registry building and caching the lockable tree.
#[derive(Debug)]
pub struct Lockables {
    root: Arc<Lockable>,
    namespaces: DashMap<NamespaceId, Arc<Lockable>>,
    entities: DashMap<EntityId, Arc<Lockable>>,
}

impl Lockables {
    pub fn new() -> Self {
        Self {
            root: Lockable::root(),
            namespaces: DashMap::new(),
            entities: DashMap::new(),
        }
    }

    /// The root lockable. EXCLUSIVE here freezes the whole kernel; DDL takes
    /// it briefly.
    pub fn global(&self) -> Arc<Lockable> {
        Arc::clone(&self.root)
    }

    pub fn namespace(&self, id: NamespaceId) -> Arc<Lockable> {
        self.namespaces
            .entry(id)
            .or_insert_with(|| self.root.child(LockableKey::Namespace(id)))
            .clone()
    }

    /// The lockable of an entity, parented under its namespace.
    pub fn entity(&self, namespace: NamespaceId, entity: EntityId) -> Arc<Lockable> {
        self.entities
            .entry(entity)
            .or_insert_with(|| self.namespace(namespace).child(LockableKey::Entity(entity)))
            .clone()
    }

    /// Forgets the lockable of a dropped entity.
    pub fn forget_entity(&self, entity: EntityId) {
        self.entities.remove(&entity);
    }
}

impl Default for Lockables {
    fn default() -> Self {
        Self::new()
    }
}
