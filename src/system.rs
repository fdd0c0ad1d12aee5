//! Composition root.
//!
//! [`MemorySystem`] owns one store, one audit logger and the components built
//! on top of them. Agents get access only through
//! [`MemorySystem::agent`], which returns a [`CapabilityEnforcer`].

use std::sync::Arc;

use tracing::info;

use crate::audit::AuditLogger;
use crate::capability::{
    CapabilityEnforcer, CapabilityManifest, CredentialScrubber, ManifestRegistry, Scope,
};
use crate::code::CodeGraph;
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::experience::{AgentId, ExperienceStore};
use crate::graph::GraphStore;
use crate::knowledge::HierarchicalMemoryManager;
use crate::retrieval::RetrievalEngine;

/// Components shared by every enforcer of one system.
pub(crate) struct MemoryComponents {
    pub(crate) graph: Arc<GraphStore>,
    pub(crate) experiences: ExperienceStore,
    pub(crate) knowledge: HierarchicalMemoryManager,
    pub(crate) retrieval: RetrievalEngine,
    pub(crate) code: CodeGraph,
    pub(crate) audit: AuditLogger,
    pub(crate) manifests: ManifestRegistry,
    pub(crate) scrubber: CredentialScrubber,
    pub(crate) config: MemoryConfig,
}

/// A memory namespace: backing store, audit trail and registered agents.
#[derive(Clone)]
pub struct MemorySystem {
    inner: Arc<MemoryComponents>,
}

impl MemorySystem {
    /// Open the store and audit sink named by `config`.
    pub fn open(config: MemoryConfig) -> Result<Self> {
        config.validate()?;

        let graph = match &config.database_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                GraphStore::open(path, &config.store_options())?
            }
            None => GraphStore::in_memory()?,
        };
        let audit = match &config.audit_path {
            Some(path) => AuditLogger::open(path)?,
            None => AuditLogger::in_memory(),
        };
        info!(
            database = ?config.database_path,
            audit = ?config.audit_path,
            "memory system opened"
        );

        Ok(Self::assemble(Arc::new(graph), audit, config))
    }

    /// Fully in-memory system with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::open(MemoryConfig::default())
    }

    fn assemble(graph: Arc<GraphStore>, audit: AuditLogger, config: MemoryConfig) -> Self {
        let inner = MemoryComponents {
            experiences: ExperienceStore::new(Arc::clone(&graph)),
            knowledge: HierarchicalMemoryManager::new(Arc::clone(&graph))
                .with_settings(config.knowledge_settings())
                .with_locks(config.concept_locks()),
            retrieval: RetrievalEngine::new(Arc::clone(&graph)).with_half_life(config.half_life()),
            code: CodeGraph::new(Arc::clone(&graph)),
            graph,
            audit,
            manifests: ManifestRegistry::new(),
            scrubber: CredentialScrubber::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Validate and register an agent's manifest, replacing any earlier one.
    pub fn register_manifest(&self, manifest: CapabilityManifest) -> Result<()> {
        self.inner.manifests.register(manifest)
    }

    /// Revoke an agent's manifest. Its enforcers reject every later call.
    pub fn revoke_manifest(&self, agent_id: &AgentId) -> Result<bool> {
        self.inner.manifests.revoke(agent_id)
    }

    /// A manifest carrying this system's default query limits.
    pub fn default_manifest(&self, agent_id: impl Into<AgentId>, scope: Scope) -> CapabilityManifest {
        CapabilityManifest::new(agent_id, scope).with_limits(
            self.inner.config.default_cost_budget,
            self.inner.config.default_query_time_seconds,
        )
    }

    /// Capability-checked handle for one agent.
    ///
    /// Handing out an enforcer grants nothing by itself; every call is checked
    /// against the manifest registered at call time.
    pub fn agent(&self, agent_id: impl Into<AgentId>) -> CapabilityEnforcer {
        CapabilityEnforcer::new(agent_id.into(), Arc::clone(&self.inner))
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.inner.graph
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }
}
