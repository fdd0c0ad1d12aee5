//! Per-agent capability manifests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::experience::{AgentId, SessionId};
use crate::graph::{Deadline, QueryLimits};

/// Which sessions an agent may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only `allowed_sessions` and sessions the agent started itself
    Session,
    /// Any session may be read
    Global,
}

/// Declarative access-control contract for one agent.
///
/// Loaded from JSON or TOML, rejected at load time if malformed:
///
/// ```toml
/// agent_id = "reviewer"
/// scope = "session"
/// allowed_sessions = ["5f0c..."]
/// code_graph_scope = ["src/**/*.rs"]
/// max_query_cost = 500
/// max_query_time_seconds = 2.0
/// can_access_credentials = false
/// can_write_knowledge = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityManifest {
    pub agent_id: AgentId,
    pub scope: Scope,
    #[serde(default)]
    pub allowed_sessions: BTreeSet<SessionId>,
    /// Glob patterns of code paths the agent may query or index
    #[serde(default)]
    pub code_graph_scope: Vec<String>,
    pub max_query_cost: u64,
    pub max_query_time_seconds: f64,
    /// Must be false; credentials are never exposed
    #[serde(default)]
    pub can_access_credentials: bool,
    #[serde(default)]
    pub can_write_knowledge: bool,
}

impl CapabilityManifest {
    pub fn new(agent_id: impl Into<AgentId>, scope: Scope) -> Self {
        Self {
            agent_id: agent_id.into(),
            scope,
            allowed_sessions: BTreeSet::new(),
            code_graph_scope: Vec::new(),
            max_query_cost: 10_000,
            max_query_time_seconds: 5.0,
            can_access_credentials: false,
            can_write_knowledge: false,
        }
    }

    pub fn allow_session(mut self, session_id: SessionId) -> Self {
        self.allowed_sessions.insert(session_id);
        self
    }

    pub fn allow_code(mut self, pattern: impl Into<String>) -> Self {
        self.code_graph_scope.push(pattern.into());
        self
    }

    pub fn with_limits(mut self, max_query_cost: u64, max_query_time_seconds: f64) -> Self {
        self.max_query_cost = max_query_cost;
        self.max_query_time_seconds = max_query_time_seconds;
        self
    }

    pub fn write_knowledge(mut self, allowed: bool) -> Self {
        self.can_write_knowledge = allowed;
        self
    }

    /// Parse and validate a JSON manifest.
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid capability manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse and validate a TOML manifest.
    pub fn from_toml(text: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid capability manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest file; `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Check the manifest's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.as_str().trim().is_empty() {
            return Err(Error::validation("manifest agent_id must not be empty"));
        }
        if self.can_access_credentials {
            return Err(Error::validation(format!(
                "manifest for {} grants credential access, which is never allowed",
                self.agent_id
            )));
        }
        if self.max_query_cost == 0 {
            return Err(Error::validation("max_query_cost must be positive"));
        }
        if !self.max_query_time_seconds.is_finite() || self.max_query_time_seconds <= 0.0 {
            return Err(Error::validation(format!(
                "max_query_time_seconds must be a positive number, got {}",
                self.max_query_time_seconds
            )));
        }
        self.query_time()?;
        self.code_patterns()?;
        Ok(())
    }

    fn query_time(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.max_query_time_seconds).map_err(|e| {
            Error::validation(format!(
                "max_query_time_seconds {} is not a valid duration: {}",
                self.max_query_time_seconds, e
            ))
        })
    }

    fn code_patterns(&self) -> Result<Vec<glob::Pattern>> {
        self.code_graph_scope
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    Error::validation(format!("invalid code_graph_scope pattern '{}': {}", p, e))
                })
            })
            .collect()
    }

    /// Whether `path` matches the code graph allow-list. An empty list allows nothing.
    pub fn allows_path(&self, path: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.code_patterns()
            .map(|patterns| patterns.iter().any(|p| p.matches_with(path, options)))
            .unwrap_or(false)
    }

    /// Cost and time limits for one read. The deadline starts now.
    pub fn query_limits(&self, max_depth: u32) -> Result<QueryLimits> {
        Ok(QueryLimits::new(max_depth, self.max_query_cost)
            .with_deadline(Deadline::after(self.query_time()?)))
    }
}

/// Registered manifests, keyed by agent.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    manifests: RwLock<HashMap<AgentId, Arc<CapabilityManifest>>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a manifest, replacing any previous one for the agent.
    pub fn register(&self, manifest: CapabilityManifest) -> Result<()> {
        manifest.validate()?;
        let mut manifests = self
            .manifests
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock manifest registry: {}", e)))?;
        info!(agent_id = %manifest.agent_id, scope = ?manifest.scope, "capability manifest registered");
        manifests.insert(manifest.agent_id.clone(), Arc::new(manifest));
        Ok(())
    }

    /// Remove an agent's manifest; later calls by that agent are rejected.
    pub fn revoke(&self, agent_id: &AgentId) -> Result<bool> {
        let mut manifests = self
            .manifests
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock manifest registry: {}", e)))?;
        Ok(manifests.remove(agent_id).is_some())
    }

    pub fn get(&self, agent_id: &AgentId) -> Result<Option<Arc<CapabilityManifest>>> {
        let manifests = self
            .manifests
            .read()
            .map_err(|e| Error::Internal(format!("Failed to lock manifest registry: {}", e)))?;
        Ok(manifests.get(agent_id).cloned())
    }
}
