//! Relevance-ranked reads.
//!
//! Knowledge is scored as `similarity * confidence * recency_weight`, where
//! the recency weight halves every configured half-life since the node was
//! last reinforced. Superseded versions are only returned on request and are
//! labelled with their successor.

mod engine;

pub use engine::{
    KnowledgeStatus, RankedExperience, RankedKnowledge, RetrievalEngine, RetrievalQuery,
};
