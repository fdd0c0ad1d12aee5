//! Semantic memory: knowledge derived from experiences.
//!
//! Each concept has one current head. Reinforcement updates the head in
//! place; an update or contradiction creates a new head linked to the old one
//! by a SUPERSEDES edge, so older versions stay available as history.

mod lock;
mod manager;
pub mod similarity;
mod types;

#[cfg(test)]
mod proptest;

pub use lock::{ConceptGuard, ConceptLocks};
pub use manager::{
    reinforce_confidence, ConceptSummary, HierarchicalMemoryManager, KnowledgeSettings,
    KnowledgeSummary,
};
pub use types::{
    ExtractionAction, ExtractionMode, ExtractionOutcome, ExtractionRequest, Knowledge, KnowledgeId,
};
