//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::StoreOptions;
use crate::knowledge::{ConceptLocks, KnowledgeSettings};

/// Configuration for a [`MemorySystem`](crate::MemorySystem).
///
/// `None` paths select the in-memory store and audit sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Backing database file
    pub database_path: Option<PathBuf>,
    /// Append-only audit file
    pub audit_path: Option<PathBuf>,
    /// Days after which a knowledge node's recency weight halves
    pub knowledge_half_life_days: f64,
    pub contradiction_threshold: f64,
    pub reinforcement_rate: f64,
    /// Cost budget for manifests created with [`MemorySystem::default_manifest`](crate::MemorySystem::default_manifest)
    pub default_cost_budget: u64,
    pub default_query_time_seconds: f64,
    pub busy_timeout_ms: u64,
    pub concept_lock_retries: u32,
    pub concept_lock_backoff_ms: u64,
    pub reader_pool_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            audit_path: None,
            knowledge_half_life_days: 30.0,
            contradiction_threshold: 0.35,
            reinforcement_rate: 0.5,
            default_cost_budget: 10_000,
            default_query_time_seconds: 5.0,
            busy_timeout_ms: 5_000,
            concept_lock_retries: 3,
            concept_lock_backoff_ms: 10,
            reader_pool_size: 4,
        }
    }
}

impl MemoryConfig {
    /// Create configuration from `AGENT_MEMORY_*` environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("AGENT_MEMORY_DATABASE_PATH").ok().map(PathBuf::from),
            audit_path: std::env::var("AGENT_MEMORY_AUDIT_PATH").ok().map(PathBuf::from),
            knowledge_half_life_days: env_or("AGENT_MEMORY_HALF_LIFE_DAYS", defaults.knowledge_half_life_days),
            contradiction_threshold: env_or(
                "AGENT_MEMORY_CONTRADICTION_THRESHOLD",
                defaults.contradiction_threshold,
            ),
            reinforcement_rate: env_or("AGENT_MEMORY_REINFORCEMENT_RATE", defaults.reinforcement_rate),
            default_cost_budget: env_or("AGENT_MEMORY_COST_BUDGET", defaults.default_cost_budget),
            default_query_time_seconds: env_or(
                "AGENT_MEMORY_QUERY_TIME_SECONDS",
                defaults.default_query_time_seconds,
            ),
            busy_timeout_ms: env_or("AGENT_MEMORY_BUSY_TIMEOUT_MS", defaults.busy_timeout_ms),
            concept_lock_retries: env_or("AGENT_MEMORY_LOCK_RETRIES", defaults.concept_lock_retries),
            concept_lock_backoff_ms: env_or(
                "AGENT_MEMORY_LOCK_BACKOFF_MS",
                defaults.concept_lock_backoff_ms,
            ),
            reader_pool_size: env_or("AGENT_MEMORY_READER_POOL_SIZE", defaults.reader_pool_size),
        }
    }

    /// One database and one audit file per namespace under `root`.
    pub fn for_namespace(root: impl AsRef<Path>, namespace: &str) -> Self {
        let root = root.as_ref();
        Self {
            database_path: Some(root.join(format!("{}.db", namespace))),
            audit_path: Some(root.join(format!("{}.audit.jsonl", namespace))),
            ..Self::default()
        }
    }

    /// Parse a TOML config file. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid memory config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.knowledge_half_life_days.is_finite() || self.knowledge_half_life_days <= 0.0 {
            return Err(Error::Config(format!(
                "knowledge_half_life_days must be positive, got {}",
                self.knowledge_half_life_days
            )));
        }
        for (name, value) in [
            ("contradiction_threshold", self.contradiction_threshold),
            ("reinforcement_rate", self.reinforcement_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be in [0, 1], got {}", name, value)));
            }
        }
        if self.default_cost_budget == 0 {
            return Err(Error::Config("default_cost_budget must be positive".into()));
        }
        if !self.default_query_time_seconds.is_finite()
            || self.default_query_time_seconds <= 0.0
            || Duration::try_from_secs_f64(self.default_query_time_seconds).is_err()
        {
            return Err(Error::Config(format!(
                "default_query_time_seconds must be a positive duration, got {}",
                self.default_query_time_seconds
            )));
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            reader_pool_size: self.reader_pool_size,
        }
    }

    pub fn knowledge_settings(&self) -> KnowledgeSettings {
        KnowledgeSettings {
            reinforcement_rate: self.reinforcement_rate,
            contradiction_threshold: self.contradiction_threshold,
        }
    }

    pub fn concept_locks(&self) -> ConceptLocks {
        ConceptLocks::new(
            self.concept_lock_retries,
            Duration::from_millis(self.concept_lock_backoff_ms),
        )
    }

    pub fn half_life(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.knowledge_half_life_days * 86_400_000.0) as i64)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
