// Adapter contract.
//
// An adapter presents one backing store under the common scan/modify
// surface. The kernel plans physical subtrees in the adapter's convention,
// hands them to `execute`, and drives the transactional hooks during
// two-phase commit. Adapters never see the lock manager or the sequencer;
// versioning context reaches them through the MVCC state they capture at
// deployment.

pub mod delegate;
pub mod memory;
pub mod registry;

pub use delegate::RelationalScanDelegate;
pub use memory::MemoryAdapter;
pub use registry::{AdapterRegistry, AdapterTemplate};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::algebra::{AlgBuilder, AlgNode, RowSet};
use crate::catalog::Entity;
use crate::common::{AdapterId, AllocationId, DataModel, PolyValue};
use crate::error::Result;
use crate::transaction::{Transaction, Xid};

/// Whether an adapter owns its data (store) or surfaces foreign data
/// (source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    Store,
    Source,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Store => write!(f, "STORE"),
            AdapterKind::Source => write!(f, "SOURCE"),
        }
    }
}

/// Capability vocabulary consulted by planner rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub relational: bool,
    pub document: bool,
    pub graph: bool,
    pub joins: bool,
    pub nested_arrays: bool,
    pub window_functions: bool,
    pub geo_functions: bool,
    pub modify: bool,
}

impl AdapterCapabilities {
    /// A store that speaks all three models natively.
    pub fn polystore() -> Self {
        Self {
            relational: true,
            document: true,
            graph: true,
            joins: true,
            nested_arrays: true,
            window_functions: false,
            geo_functions: false,
            modify: true,
        }
    }

    /// A plain relational store; document and graph requests go through the
    /// scan delegate.
    pub fn relational_only() -> Self {
        Self {
            relational: true,
            document: false,
            graph: false,
            joins: true,
            nested_arrays: false,
            window_functions: false,
            geo_functions: false,
            modify: true,
        }
    }

    pub fn supports_model(&self, model: DataModel) -> bool {
        match model {
            DataModel::Relational => self.relational,
            DataModel::Document => self.document,
            DataModel::Graph => self.graph,
        }
    }
}

/// Column surfaced by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedColumn {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub position: usize,
    pub primary: bool,
}

/// Node of the discovery metadata tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataNode {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<MetadataNode>,
}

impl MetadataNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_child(mut self, child: MetadataNode) -> Self {
        self.children.push(child);
        self
    }
}

/// The contract every backing store implements.
pub trait Adapter: Send + Sync {
    fn id(&self) -> AdapterId;
    fn unique_name(&self) -> &str;
    fn adapter_name(&self) -> &str;
    fn kind(&self) -> AdapterKind;
    fn capabilities(&self) -> AdapterCapabilities;

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn create_table(&self, entity: &Entity) -> Result<()>;
    fn create_collection(&self, entity: &Entity) -> Result<()>;
    fn create_graph(&self, entity: &Entity) -> Result<()>;
    fn drop_table(&self, entity: &Entity) -> Result<()>;
    fn drop_collection(&self, entity: &Entity) -> Result<()>;
    fn drop_graph(&self, entity: &Entity) -> Result<()>;
    fn truncate(&self, entity: &Entity) -> Result<()>;

    /// Refreshes surface no new work for most stores; sources re-read their
    /// backing data.
    fn refresh_table(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    fn refresh_collection(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    fn refresh_graph(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Planning and execution
    // ------------------------------------------------------------------

    /// Produces the physical scan subtree for an allocation, in this
    /// adapter's convention. Graph allocations on relational-only adapters
    /// compose four relational scans under a GRAPH transform.
    fn scan(&self, allocation: AllocationId, builder: &mut AlgBuilder) -> Result<Arc<AlgNode>>;

    /// Executes a physical subtree under the given transaction.
    fn execute(&self, plan: &AlgNode, txn: &Transaction) -> Result<RowSet>;

    // ------------------------------------------------------------------
    // Transactional hooks
    // ------------------------------------------------------------------

    /// Votes on commit. `false` aborts the whole transaction.
    fn prepare(&self, xid: &Xid) -> Result<bool>;
    fn commit(&self, xid: &Xid) -> Result<()>;
    fn rollback(&self, xid: &Xid) -> Result<()>;
    fn shutdown(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Metadata and discovery
    // ------------------------------------------------------------------

    /// Columns a source exports; stores return nothing.
    fn exported_columns(&self) -> Result<Vec<ExportedColumn>> {
        Ok(Vec::new())
    }

    fn fetch_metadata_tree(&self) -> Result<MetadataNode> {
        Ok(MetadataNode::new(self.unique_name()))
    }

    fn fetch_preview(&self, _entity: &Entity, _limit: usize) -> Result<Vec<PolyValue>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Adapter descriptor
// ============================================================================

/// Deployment mode of an adapter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeployMode {
    Default,
    Docker,
    Embedded,
    Remote,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Default => "default",
            DeployMode::Docker => "docker",
            DeployMode::Embedded => "embedded",
            DeployMode::Remote => "remote",
        }
    }
}

/// One configurable setting of an adapter, scoped to a deployment mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSetting {
    pub name: String,
    pub default_value: String,
    pub required: bool,
    /// Bindable options; empty means free-form.
    pub options: Vec<String>,
}

impl AdapterSetting {
    pub fn new(name: impl Into<String>, default_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: default_value.into(),
            required: false,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

/// Structured description of an adapter template, surfaced to clients that
/// deploy instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub name: String,
    pub description: String,
    pub kind: AdapterKind,
    /// Multiset of supported deployment modes.
    pub used_modes: Vec<DeployMode>,
    /// Settings keyed by mode name. The `mode` setting is always present
    /// and lists the available modes.
    pub settings: BTreeMap<String, Vec<AdapterSetting>>,
}

impl AdapterDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: AdapterKind,
        used_modes: Vec<DeployMode>,
    ) -> Self {
        let mode_options: Vec<String> = used_modes.iter().map(|m| m.as_str().to_string()).collect();
        let default_mode = mode_options.first().cloned().unwrap_or_default();
        let mut settings = BTreeMap::new();
        settings.insert(
            "default".to_string(),
            vec![AdapterSetting::new("mode", default_mode)
                .required()
                .with_options(mode_options)],
        );
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            used_modes,
            settings,
        }
    }

    pub fn with_setting(mut self, mode: &str, setting: AdapterSetting) -> Self {
        self.settings.entry(mode.to_string()).or_default().push(setting);
        self
    }

    /// Binds the configured Docker instances as options of the docker
    /// mode's `instance` setting.
    pub fn bind_docker_instances(mut self, instances: &[String]) -> Self {
        if self.used_modes.contains(&DeployMode::Docker) {
            self.settings.entry("docker".to_string()).or_default().push(
                AdapterSetting::new("instance", instances.first().cloned().unwrap_or_default())
                    .required()
                    .with_options(instances.to_vec()),
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_models() {
        let caps = AdapterCapabilities::relational_only();
        assert!(caps.supports_model(DataModel::Relational));
        assert!(!caps.supports_model(DataModel::Document));
        assert!(AdapterCapabilities::polystore().supports_model(DataModel::Graph));
    }

    #[test]
    fn test_descriptor_always_lists_modes() {
        let descriptor = AdapterDescriptor::new(
            "memory",
            "In-process store",
            AdapterKind::Store,
            vec![DeployMode::Embedded, DeployMode::Docker],
        );
        let defaults = &descriptor.settings["default"];
        let mode = defaults.iter().find(|s| s.name == "mode").unwrap();
        assert_eq!(mode.options, vec!["embedded", "docker"]);
    }

    #[test]
    fn test_docker_instances_bindable() {
        let descriptor = AdapterDescriptor::new(
            "memory",
            "In-process store",
            AdapterKind::Store,
            vec![DeployMode::Docker],
        )
        .bind_docker_instances(&["local-1".to_string(), "local-2".to_string()]);
        let docker = &descriptor.settings["docker"];
        let instance = docker.iter().find(|s| s.name == "instance").unwrap();
        assert_eq!(instance.options.len(), 2);
    }
}
