//! Capability enforcement.
//!
//! Agents never touch the stores directly. Each agent gets a
//! [`CapabilityEnforcer`] that checks its [`CapabilityManifest`] before every
//! call, scrubs credentials out of free text, injects the manifest's query
//! limits and writes one audit record per call.
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_memory::{CapabilityManifest, ExperienceType, MemorySystem, Scope};
//!
//! let system = MemorySystem::in_memory()?;
//! system.register_manifest(CapabilityManifest::new("planner", Scope::Session).write_knowledge(true))?;
//!
//! let agent = system.agent("planner");
//! let session = agent.start_session("Fix the flaky login test")?;
//! agent.record_experience(&session.id, ExperienceType::Observation, "token=abc123 expired", ["auth"])?;
//! ```

mod enforcer;
mod manifest;
mod scrub;

pub use enforcer::{CapabilityEnforcer, MemorySummary, Operation};
pub use manifest::{CapabilityManifest, ManifestRegistry, Scope};
pub use scrub::{CredentialKind, CredentialScrubber, ScrubResult, REDACTED};
