//! Episodic memory: sessions and the experiences recorded during them.
//!
//! Experiences are write-once. A session accepts new experiences until it is
//! finalized, after which it is immutable.

pub mod tags;
mod store;
mod types;

pub use store::{ExperienceCounts, ExperienceCursor, ExperienceStore};
pub(crate) use store::load_session;
pub use types::{
    AgentId, Experience, ExperienceId, ExperienceType, Session, SessionId, SessionOutcome,
    REDACTED_TAG,
};
pub(crate) use types::{expect_type, node_backed_id};
