//! # agent-memory
//!
//! Persistent, capability-secured memory for autonomous agents, backed by a
//! transactional knowledge graph.
//!
//! ## Core Components
//!
//! - **Graph**: SQLite-backed nodes and edges with bounded traversals
//! - **Experience**: Sessions and the write-once experiences recorded in them
//! - **Knowledge**: Concepts derived from experiences, versioned by SUPERSEDES
//! - **Retrieval**: Similarity, confidence and recency ranked reads
//! - **Code**: File, class and function structure for code-context queries
//! - **Capability**: Per-agent manifests, credential scrubbing and auditing
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_memory::{
//!     CapabilityManifest, ExperienceType, ExtractionRequest, MemorySystem, RetrievalQuery, Scope,
//! };
//!
//! let system = MemorySystem::in_memory()?;
//! system.register_manifest(CapabilityManifest::new("planner", Scope::Session).write_knowledge(true))?;
//! let agent = system.agent("planner");
//!
//! let session = agent.start_session("Fix login timeout")?;
//! let exp = agent.record_experience(
//!     &session.id,
//!     ExperienceType::Observation,
//!     "Session tokens expire after 15 minutes",
//!     ["auth"],
//! )?;
//! agent.extract_knowledge(ExtractionRequest::new(
//!     "token expiry",
//!     "Session tokens expire after 15 minutes of inactivity",
//!     vec![exp.id],
//!     0.7,
//! ))?;
//!
//! for hit in agent.retrieve_knowledge(RetrievalQuery::new("when do tokens expire"))? {
//!     println!("{} ({:.2})", hit.knowledge.concept, hit.score);
//! }
//! ```

pub mod audit;
pub mod capability;
pub mod code;
pub mod config;
pub mod error;
pub mod experience;
pub mod graph;
pub mod knowledge;
pub mod retrieval;
pub mod system;

// Re-exports for convenience
pub use audit::{AuditLogger, AuditRecord};
pub use capability::{
    CapabilityEnforcer, CapabilityManifest, CredentialScrubber, MemorySummary, Operation, Scope,
};
pub use code::{CodeContext, CodeEntity, CodeFile, CodeSymbol};
pub use config::MemoryConfig;
pub use error::{Error, Result};
pub use experience::{
    AgentId, Experience, ExperienceId, ExperienceType, Session, SessionId, SessionOutcome,
};
pub use graph::{GraphStore, NodeId, QueryLimits};
pub use knowledge::{
    ExtractionAction, ExtractionMode, ExtractionOutcome, ExtractionRequest, Knowledge, KnowledgeId,
};
pub use retrieval::{KnowledgeStatus, RankedKnowledge, RetrievalQuery};
pub use system::MemorySystem;
