// Catalog: the logical schema of the kernel.
//
// Readers take an immutable snapshot (`Arc<CatalogSnapshot>`) and never
// block. Writers clone the snapshot, mutate the clone, and install it under
// a dedicated DDL mutex. That mutex serializes catalog mutation only; entity
// data is protected by the lockable hierarchy, not by the catalog.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::adapter::AdapterKind;
use crate::common::{
    AdapterId, AllocationId, DataModel, EntityId, EntityType, NamespaceId,
};
use crate::error::{DbError, Result};

/// A namespace groups entities of one data model and fixes whether they are
/// versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    pub data_model: DataModel,
    /// Entities in an MVCC namespace carry `_eid`/`_vid` and obey snapshot
    /// visibility.
    pub mvcc: bool,
}

/// A logical table, collection, or graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub namespace: NamespaceId,
    pub name: String,
    pub data_model: DataModel,
    pub entity_type: EntityType,
    pub modifiable: bool,
    /// Declared payload columns (relational); empty for document/graph.
    pub columns: Vec<String>,
}

impl Entity {
    pub fn is_modifiable(&self) -> bool {
        self.modifiable && self.entity_type.is_modifiable()
    }
}

/// Persisted record of a deployed adapter, used to restore instances on
/// startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRecord {
    pub id: AdapterId,
    pub unique_name: String,
    pub adapter_name: String,
    pub kind: AdapterKind,
    pub mode: String,
    pub settings: BTreeMap<String, String>,
}

/// Placement of an entity on an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub entity: EntityId,
    pub adapter: AdapterId,
    pub allocation: AllocationId,
}

/// Declared integrity constraint, enforced at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub entity: EntityId,
    pub name: String,
    pub kind: ConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    PrimaryKey { fields: Vec<String> },
    Unique { fields: Vec<String> },
}

/// One immutable version of the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    namespaces: BTreeMap<NamespaceId, Namespace>,
    entities: BTreeMap<EntityId, Entity>,
    adapters: BTreeMap<AdapterId, AdapterRecord>,
    placements: Vec<Placement>,
    constraints: Vec<Constraint>,
    next_id: u64,
}

impl CatalogSnapshot {
    pub fn namespace(&self, id: NamespaceId) -> Option<&Namespace> {
        self.namespaces.get(&id)
    }

    pub fn namespace_by_name(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.values().find(|ns| ns.name == name)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_by_name(&self, namespace: NamespaceId, name: &str) -> Option<&Entity> {
        self.entities
            .values()
            .find(|e| e.namespace == namespace && e.name == name)
    }

    pub fn entities_in(&self, namespace: NamespaceId) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| e.namespace == namespace)
    }

    pub fn adapter_records(&self) -> impl Iterator<Item = &AdapterRecord> {
        self.adapters.values()
    }

    pub fn adapter_record(&self, id: AdapterId) -> Option<&AdapterRecord> {
        self.adapters.get(&id)
    }

    pub fn placements_of(&self, entity: EntityId) -> Vec<&Placement> {
        self.placements.iter().filter(|p| p.entity == entity).collect()
    }

    pub fn placement_by_allocation(&self, allocation: AllocationId) -> Option<&Placement> {
        self.placements.iter().find(|p| p.allocation == allocation)
    }

    pub fn allocations_on(&self, adapter: AdapterId) -> Vec<&Placement> {
        self.placements.iter().filter(|p| p.adapter == adapter).collect()
    }

    pub fn constraints_of(&self, entity: EntityId) -> Vec<&Constraint> {
        self.constraints.iter().filter(|c| c.entity == entity).collect()
    }

    /// True when the entity lives in an MVCC namespace.
    pub fn is_mvcc(&self, entity: EntityId) -> bool {
        self.entity(entity)
            .and_then(|e| self.namespace(e.namespace))
            .map(|ns| ns.mvcc)
            .unwrap_or(false)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Copy-on-write catalog.
#[derive(Debug)]
pub struct Catalog {
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    ddl_guard: Mutex<()>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            ddl_guard: Mutex::new(()),
        }
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut CatalogSnapshot) -> Result<R>) -> Result<R> {
        let _guard = self.ddl_guard.lock();
        let mut next = (**self.snapshot.read()).clone();
        let result = f(&mut next)?;
        *self.snapshot.write() = Arc::new(next);
        Ok(result)
    }

    pub fn add_namespace(
        &self,
        name: impl Into<String>,
        data_model: DataModel,
        mvcc: bool,
    ) -> Result<NamespaceId> {
        let name = name.into();
        self.mutate(|snapshot| {
            if snapshot.namespace_by_name(&name).is_some() {
                return Err(DbError::Catalog(format!("namespace '{}' exists", name)));
            }
            let id = snapshot.allocate_id();
            snapshot.namespaces.insert(
                id,
                Namespace {
                    id,
                    name: name.clone(),
                    data_model,
                    mvcc,
                },
            );
            Ok(id)
        })
    }

    pub fn add_entity(
        &self,
        namespace: NamespaceId,
        name: impl Into<String>,
        data_model: DataModel,
        entity_type: EntityType,
        columns: Vec<String>,
    ) -> Result<EntityId> {
        let name = name.into();
        self.mutate(|snapshot| {
            if snapshot.namespace(namespace).is_none() {
                return Err(DbError::Catalog(format!("namespace {} not found", namespace)));
            }
            if snapshot.entity_by_name(namespace, &name).is_some() {
                return Err(DbError::Catalog(format!("entity '{}' exists", name)));
            }
            let id = snapshot.allocate_id();
            snapshot.entities.insert(
                id,
                Entity {
                    id,
                    namespace,
                    name: name.clone(),
                    data_model,
                    entity_type,
                    modifiable: entity_type.is_modifiable(),
                    columns,
                },
            );
            Ok(id)
        })
    }

    /// Marks an existing namespace as versioned (or not). Applied at
    /// startup for namespaces listed in the kernel configuration.
    pub fn set_namespace_mvcc(&self, id: NamespaceId, mvcc: bool) -> Result<()> {
        self.mutate(|snapshot| {
            let namespace = snapshot
                .namespaces
                .get_mut(&id)
                .ok_or_else(|| DbError::Catalog(format!("namespace {} not found", id)))?;
            namespace.mvcc = mvcc;
            Ok(())
        })
    }

    pub fn drop_entity(&self, id: EntityId) -> Result<()> {
        self.mutate(|snapshot| {
            snapshot
                .entities
                .remove(&id)
                .ok_or_else(|| DbError::Catalog(format!("entity {} not found", id)))?;
            snapshot.placements.retain(|p| p.entity != id);
            snapshot.constraints.retain(|c| c.entity != id);
            Ok(())
        })
    }

    pub fn add_placement(&self, entity: EntityId, adapter: AdapterId) -> Result<AllocationId> {
        self.mutate(|snapshot| {
            if snapshot.entity(entity).is_none() {
                return Err(DbError::Catalog(format!("entity {} not found", entity)));
            }
            let allocation = snapshot.allocate_id();
            snapshot.placements.push(Placement {
                entity,
                adapter,
                allocation,
            });
            Ok(allocation)
        })
    }

    pub fn add_constraint(
        &self,
        entity: EntityId,
        name: impl Into<String>,
        kind: ConstraintKind,
    ) -> Result<()> {
        let name = name.into();
        self.mutate(|snapshot| {
            if snapshot.entity(entity).is_none() {
                return Err(DbError::Catalog(format!("entity {} not found", entity)));
            }
            snapshot.constraints.push(Constraint { entity, name, kind });
            Ok(())
        })
    }

    pub fn register_adapter_record(&self, record: AdapterRecord) -> Result<()> {
        self.mutate(|snapshot| {
            snapshot.adapters.insert(record.id, record);
            Ok(())
        })
    }

    pub fn remove_adapter_record(&self, id: AdapterId) -> Result<()> {
        self.mutate(|snapshot| {
            snapshot.adapters.remove(&id);
            Ok(())
        })
    }

    /// Highest id handed out so far; adapter restoration seeds its id
    /// counter past this.
    pub fn high_water_mark(&self) -> u64 {
        self.snapshot().next_id
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&*snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&json)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            ddl_guard: Mutex::new(()),
        })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
