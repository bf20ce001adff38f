// Adapter template registry and instance lifecycle.
//
// Templates are registered once per `(name, kind)` with a factory function;
// deployment instantiates them under a globally unique lower-case name and
// persists an adapter record in the catalog so `restore` can rebuild every
// instance on startup. Removal refuses while catalog allocations still
// target the instance.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::catalog::{AdapterRecord, Catalog};
use crate::common::AdapterId;
use crate::error::{DbError, Result};

use super::{Adapter, AdapterDescriptor, AdapterKind};

/// Factory producing an adapter instance from its deployment parameters.
pub type AdapterFactory = dyn Fn(AdapterId, &str, &BTreeMap<String, String>) -> Result<Arc<dyn Adapter>>
    + Send
    + Sync;

/// A registered adapter template.
pub struct AdapterTemplate {
    pub descriptor: AdapterDescriptor,
    pub default_settings: BTreeMap<String, String>,
    factory: Box<AdapterFactory>,
}

/// Registry of templates and deployed instances.
pub struct AdapterRegistry {
    catalog: Arc<Catalog>,
    templates: RwLock<HashMap<(String, AdapterKind), AdapterTemplate>>,
    instances: RwLock<HashMap<AdapterId, Arc<dyn Adapter>>>,
    by_unique_name: RwLock<HashMap<String, AdapterId>>,
    next_id: AtomicU64,
}

impl AdapterRegistry {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            templates: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            by_unique_name: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1_000),
        }
    }

    /// Registers a template under its case-insensitive `(name, kind)` key.
    pub fn register(
        &self,
        descriptor: AdapterDescriptor,
        default_settings: BTreeMap<String, String>,
        factory: Box<AdapterFactory>,
    ) -> Result<()> {
        let key = (descriptor.name.to_lowercase(), descriptor.kind);
        let mut templates = self.templates.write();
        if templates.contains_key(&key) {
            return Err(DbError::Catalog(format!(
                "adapter template '{}' ({}) already registered",
                key.0, descriptor.kind
            )));
        }
        tracing::debug!(name = %key.0, kind = %descriptor.kind, "adapter template registered");
        templates.insert(
            key,
            AdapterTemplate {
                descriptor,
                default_settings,
                factory,
            },
        );
        Ok(())
    }

    pub fn describe(&self, name: &str, kind: AdapterKind) -> Option<AdapterDescriptor> {
        self.templates
            .read()
            .get(&(name.to_lowercase(), kind))
            .map(|t| t.descriptor.clone())
    }

    /// Deploys an instance of template `name` under `unique_name`.
    ///
    /// Names are case-insensitive; the unique name is stored lower-case and
    /// must be globally unused. The persisted catalog record makes the
    /// deployment restorable.
    pub fn deploy(
        &self,
        name: &str,
        unique_name: &str,
        settings: BTreeMap<String, String>,
    ) -> Result<Arc<dyn Adapter>> {
        let unique_name = unique_name.to_lowercase();
        if self.by_unique_name.read().contains_key(&unique_name) {
            return Err(DbError::DuplicateUniqueName(unique_name));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let adapter = self.instantiate(name, id, &unique_name, &settings)?;

        let record = AdapterRecord {
            id,
            unique_name: unique_name.clone(),
            adapter_name: adapter.adapter_name().to_string(),
            kind: adapter.kind(),
            mode: settings
                .get("mode")
                .cloned()
                .unwrap_or_else(|| "default".into()),
            settings,
        };
        self.catalog.register_adapter_record(record)?;

        self.instances.write().insert(id, Arc::clone(&adapter));
        self.by_unique_name.write().insert(unique_name.clone(), id);
        tracing::info!(%unique_name, id, "adapter deployed");
        Ok(adapter)
    }

    fn instantiate(
        &self,
        name: &str,
        id: AdapterId,
        unique_name: &str,
        settings: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn Adapter>> {
        let key_name = name.to_lowercase();
        let templates = self.templates.read();
        let matches: Vec<&AdapterTemplate> = [AdapterKind::Store, AdapterKind::Source]
            .iter()
            .filter_map(|&kind| templates.get(&(key_name.clone(), kind)))
            .collect();
        let template = match matches.as_slice() {
            [] => return Err(DbError::AdapterUnknown(name.to_string())),
            [template] => template,
            _ => {
                return Err(DbError::AdapterUnknown(format!(
                    "'{}' names both a store and a source; qualify the kind",
                    name
                )))
            }
        };

        let mut merged = template.default_settings.clone();
        for (key, value) in settings {
            merged.insert(key.clone(), value.clone());
        }
        (template.factory)(id, unique_name, &merged)
    }

    pub fn get(&self, id: AdapterId) -> Option<Arc<dyn Adapter>> {
        self.instances.read().get(&id).cloned()
    }

    /// Lookup by unique name, case-insensitive.
    pub fn get_by_unique_name(&self, unique_name: &str) -> Option<Arc<dyn Adapter>> {
        let id = *self
            .by_unique_name
            .read()
            .get(&unique_name.to_lowercase())?;
        self.get(id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Removes an instance. Refuses while catalog allocations still target
    /// it.
    pub fn remove(&self, id: AdapterId) -> Result<()> {
        let adapter = self
            .get(id)
            .ok_or_else(|| DbError::AdapterUnknown(format!("adapter id {}", id)))?;

        let allocations = self.catalog.snapshot().allocations_on(id).len();
        if allocations > 0 {
            return Err(DbError::AdapterInUse {
                unique_name: adapter.unique_name().to_string(),
                allocations,
            });
        }

        adapter.shutdown()?;
        self.catalog.remove_adapter_record(id)?;
        self.instances.write().remove(&id);
        self.by_unique_name
            .write()
            .retain(|_, stored| *stored != id);
        tracing::info!(unique_name = adapter.unique_name(), id, "adapter removed");
        Ok(())
    }

    /// Rebuilds every instance recorded in the persisted catalog. Called on
    /// startup before any statement runs.
    pub fn restore(&self) -> Result<usize> {
        let snapshot = self.catalog.snapshot();
        let mut restored = 0;
        for record in snapshot.adapter_records() {
            if self.instances.read().contains_key(&record.id) {
                continue;
            }
            let adapter = self.instantiate(
                &record.adapter_name,
                record.id,
                &record.unique_name,
                &record.settings,
            )?;
            self.instances.write().insert(record.id, adapter);
            self.by_unique_name
                .write()
                .insert(record.unique_name.clone(), record.id);
            // Keep fresh deployments clear of restored ids.
            let floor = record.id + 1;
            self.next_id.fetch_max(floor, Ordering::SeqCst);
            restored += 1;
            tracing::info!(unique_name = %record.unique_name, id = record.id, "adapter restored");
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("templates", &self.templates.read().len())
            .field("instances", &self.instance_count())
            .finish()
    }
}
