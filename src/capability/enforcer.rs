//! The capability-checked façade.
//!
//! Every call resolves the agent's manifest, checks scope, scrubs free text,
//! runs the wrapped operation with the manifest's limits, and appends exactly
//! one audit record whatever the outcome. Anything that cannot be checked is
//! rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::audit::AuditRecord;
use crate::capability::manifest::{CapabilityManifest, Scope};
use crate::code::{CodeContext, CodeFile, IndexedFile};
use crate::error::{Error, Result};
use crate::experience::{AgentId, Experience, ExperienceType, Session, SessionId, SessionOutcome, REDACTED_TAG};
use crate::knowledge::{ConceptSummary, ExtractionOutcome, ExtractionRequest, Knowledge, KnowledgeId};
use crate::retrieval::{RankedExperience, RankedKnowledge, RetrievalQuery};
use crate::system::MemoryComponents;

/// Operations exposed by the façade, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    StartSession,
    RecordExperience,
    GetSessionExperiences,
    ExtractKnowledge,
    ApplyKnowledge,
    RetrieveKnowledge,
    SearchExperiences,
    KnowledgeHistory,
    QueryCodeContext,
    IndexCode,
    FinalizeSession,
    GetMemorySummary,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::RecordExperience => "record_experience",
            Self::GetSessionExperiences => "get_session_experiences",
            Self::ExtractKnowledge => "extract_knowledge",
            Self::ApplyKnowledge => "apply_knowledge",
            Self::RetrieveKnowledge => "retrieve_knowledge",
            Self::SearchExperiences => "search_experiences",
            Self::KnowledgeHistory => "knowledge_history",
            Self::QueryCodeContext => "query_code_context",
            Self::IndexCode => "index_code",
            Self::FinalizeSession => "finalize_session",
            Self::GetMemorySummary => "get_memory_summary",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate statistics over the memory an agent can see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total_sessions: u64,
    pub finalized_sessions: u64,
    pub total_experiences: u64,
    pub total_knowledge: u64,
    pub knowledge_heads: u64,
    pub superseded_knowledge: u64,
    /// Mean confidence over current heads
    pub average_confidence: f64,
    pub concepts: BTreeMap<String, ConceptSummary>,
}

/// Per-call bookkeeping folded into the audit record.
#[derive(Default)]
struct CallContext {
    scrubbed: bool,
    warnings: Vec<String>,
}

/// Capability-checked entry point for one agent.
pub struct CapabilityEnforcer {
    agent_id: AgentId,
    components: Arc<MemoryComponents>,
    /// Sessions started through this enforcer
    owned_sessions: Mutex<BTreeSet<SessionId>>,
}

impl CapabilityEnforcer {
    pub(crate) fn new(agent_id: AgentId, components: Arc<MemoryComponents>) -> Self {
        Self {
            agent_id,
            components,
            owned_sessions: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    // ==================== Sessions ====================

    /// Start a session owned by this agent.
    #[instrument(skip(self, goal), fields(agent_id = %self.agent_id))]
    pub fn start_session(&self, goal: &str) -> Result<Session> {
        let mut ctx = CallContext::default();
        let result = self.run(Operation::StartSession, None, &mut ctx, |_, ctx| {
            let goal = self.scrub(goal, ctx);
            let session = self
                .components
                .experiences
                .begin_session(&self.agent_id, &goal, ctx.scrubbed)?;
            self.owned()?.insert(session.id.clone());
            Ok(session)
        });
        let session_id = result.as_ref().ok().map(|s| s.id.clone());
        self.audit(Operation::StartSession, session_id.as_ref(), &result, ctx)?;
        result
    }

    /// Record an experience in a writable session.
    #[instrument(skip_all, fields(agent_id = %self.agent_id, session_id = %session_id))]
    pub fn record_experience<I, S>(
        &self,
        session_id: &SessionId,
        experience_type: ExperienceType,
        content: &str,
        tags: I,
    ) -> Result<Experience>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.audited(Operation::RecordExperience, Some(session_id), |manifest, ctx| {
            self.check_writable(manifest, session_id)?;

            let content = self.scrub(content, ctx);
            let mut tags: Vec<String> = tags
                .into_iter()
                .map(|t| self.scrub(t.as_ref(), ctx))
                .collect();
            if ctx.scrubbed {
                tags.push(REDACTED_TAG.to_string());
            }
            self.components
                .experiences
                .record_experience(session_id, experience_type, &content, tags)
        })
    }

    /// All experiences of a readable session, in creation order.
    pub fn get_session_experiences(&self, session_id: &SessionId) -> Result<Vec<Experience>> {
        self.audited(Operation::GetSessionExperiences, Some(session_id), |manifest, _| {
            self.check_readable(manifest, session_id)?;
            self.components
                .experiences
                .get_session_experiences(session_id)?
                .collect()
        })
    }

    /// Close a writable session.
    #[instrument(skip_all, fields(agent_id = %self.agent_id, session_id = %session_id))]
    pub fn finalize_session(
        &self,
        session_id: &SessionId,
        outcome: SessionOutcome,
    ) -> Result<Session> {
        self.audited(Operation::FinalizeSession, Some(session_id), |manifest, ctx| {
            self.check_writable(manifest, session_id)?;
            let outcome = SessionOutcome {
                outcome: self.scrub(&outcome.outcome, ctx),
                ..outcome
            };
            self.components
                .experiences
                .finalize_with(session_id, outcome, ctx.scrubbed)
        })
    }

    // ==================== Knowledge ====================

    /// Extract knowledge from experiences the agent can read.
    #[instrument(skip(self, request), fields(agent_id = %self.agent_id, concept = %request.concept))]
    pub fn extract_knowledge(&self, request: ExtractionRequest) -> Result<ExtractionOutcome> {
        self.audited(Operation::ExtractKnowledge, None, |manifest, ctx| {
            if !manifest.can_write_knowledge {
                return Err(Error::permission(
                    Operation::ExtractKnowledge.as_str(),
                    format!("{} may not write knowledge", self.agent_id),
                ));
            }
            request.validate()?;
            for source in &request.source_experience_ids {
                let experience = self.components.experiences.get_experience(source)?;
                self.check_readable(manifest, &experience.session_id)?;
            }

            let concept = self.scrub(&request.concept, ctx);
            let description = self.scrub(&request.description, ctx);
            let request = ExtractionRequest {
                concept,
                description,
                contains_redacted_credentials: request.contains_redacted_credentials || ctx.scrubbed,
                ..request
            };

            let outcome = self.components.knowledge.extract_knowledge(request)?;
            ctx.warnings.extend(outcome.warnings.iter().cloned());
            Ok(outcome)
        })
    }

    /// Record that a writable session applied a visible piece of knowledge.
    pub fn apply_knowledge(
        &self,
        session_id: &SessionId,
        knowledge_id: &KnowledgeId,
    ) -> Result<Knowledge> {
        self.audited(Operation::ApplyKnowledge, Some(session_id), |manifest, _| {
            self.check_writable(manifest, session_id)?;
            let knowledge = self.components.knowledge.get_knowledge(knowledge_id)?;
            self.check_knowledge_visible(manifest, &knowledge)?;
            self.components
                .knowledge
                .apply_knowledge(session_id, knowledge_id)
        })
    }

    /// Rank visible knowledge against a query under the manifest's limits.
    #[instrument(skip(self, query), fields(agent_id = %self.agent_id))]
    pub fn retrieve_knowledge(&self, query: RetrievalQuery) -> Result<Vec<RankedKnowledge>> {
        self.audited(Operation::RetrieveKnowledge, None, |manifest, _| {
            let visible = match (self.visible_sessions(manifest)?, query.visible_sessions.clone()) {
                (Some(allowed), Some(requested)) => {
                    Some(allowed.intersection(&requested).cloned().collect())
                }
                (Some(allowed), None) => Some(allowed),
                (None, requested) => requested,
            };
            let query = RetrievalQuery {
                visible_sessions: visible,
                ..query
            };
            self.components
                .retrieval
                .retrieve_knowledge(&query, &manifest.query_limits(0)?)
        })
    }

    /// Rank visible experiences by content similarity.
    pub fn search_experiences(&self, text: &str, top_k: usize) -> Result<Vec<RankedExperience>> {
        self.audited(Operation::SearchExperiences, None, |manifest, _| {
            let visible = self.visible_sessions(manifest)?;
            self.components.retrieval.search_experiences(
                text,
                top_k,
                visible.as_ref(),
                &manifest.query_limits(0)?,
            )
        })
    }

    /// The version chain of a visible knowledge node, newest first.
    pub fn knowledge_history(&self, knowledge_id: &KnowledgeId) -> Result<Vec<Knowledge>> {
        self.audited(Operation::KnowledgeHistory, None, |manifest, _| {
            let knowledge = self.components.knowledge.get_knowledge(knowledge_id)?;
            self.check_knowledge_visible(manifest, &knowledge)?;

            let visible = self.visible_sessions(manifest)?;
            Ok(self
                .components
                .knowledge
                .history(knowledge_id)?
                .into_iter()
                .filter(|k| visible.as_ref().map(|s| k.is_visible_to(s)).unwrap_or(true))
                .collect())
        })
    }

    // ==================== Code Graph ====================

    /// Structural context of a file inside the agent's code scope.
    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub fn query_code_context(&self, file_path: &str, max_depth: u32) -> Result<CodeContext> {
        self.audited(Operation::QueryCodeContext, None, |manifest, _| {
            self.check_code_path(manifest, Operation::QueryCodeContext, file_path)?;
            let mut context = self.components.retrieval.query_code_context(
                file_path,
                max_depth,
                &manifest.query_limits(max_depth)?,
            )?;
            context.entities.retain(|e| manifest.allows_path(&e.path));
            Ok(context)
        })
    }

    /// Index a parsed file inside the agent's code scope.
    pub fn index_code(&self, file: &CodeFile) -> Result<IndexedFile> {
        self.audited(Operation::IndexCode, None, |manifest, _| {
            self.check_code_path(manifest, Operation::IndexCode, &file.path)?;
            self.components.code.index_file(file)
        })
    }

    // ==================== Summary ====================

    /// Aggregate statistics over the sessions and knowledge the agent can see.
    pub fn get_memory_summary(&self) -> Result<MemorySummary> {
        self.audited(Operation::GetMemorySummary, None, |manifest, _| {
            let visible = self.visible_sessions(manifest)?;
            let counts = self.components.experiences.counts(visible.as_ref())?;
            let knowledge = self.components.knowledge.summary(visible.as_ref())?;
            Ok(MemorySummary {
                total_sessions: counts.sessions,
                finalized_sessions: counts.finalized_sessions,
                total_experiences: counts.experiences,
                total_knowledge: knowledge.total,
                knowledge_heads: knowledge.heads,
                superseded_knowledge: knowledge.superseded,
                average_confidence: knowledge.average_confidence,
                concepts: knowledge.concepts,
            })
        })
    }

    // ==================== Enforcement ====================

    /// Resolve the manifest, run `f`, and audit the outcome.
    ///
    /// The audit record is appended after `f` returns. If that append fails,
    /// the audit error is returned even when `f` succeeded, so a write may
    /// already be committed when the caller sees the audit error. Results are
    /// never handed out unaudited.
    fn audited<T, F>(&self, operation: Operation, session_id: Option<&SessionId>, f: F) -> Result<T>
    where
        F: FnOnce(&CapabilityManifest, &mut CallContext) -> Result<T>,
    {
        let mut ctx = CallContext::default();
        let result = self.run(operation, session_id, &mut ctx, f);
        self.audit(operation, session_id, &result, ctx)?;
        result
    }

    fn run<T, F>(
        &self,
        operation: Operation,
        session_id: Option<&SessionId>,
        ctx: &mut CallContext,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&CapabilityManifest, &mut CallContext) -> Result<T>,
    {
        let result = self.manifest(operation).and_then(|manifest| f(manifest.as_ref(), ctx));
        if let Err(Error::Permission { reason, .. }) = &result {
            warn!(
                agent_id = %self.agent_id,
                operation = %operation,
                session_id = ?session_id.map(ToString::to_string),
                "capability check denied: {}",
                reason
            );
        }
        result
    }

    fn audit<T>(
        &self,
        operation: Operation,
        session_id: Option<&SessionId>,
        result: &Result<T>,
        ctx: CallContext,
    ) -> Result<()> {
        let audit = &self.components.audit;
        let mut record = AuditRecord::new(self.agent_id.as_str(), operation.as_str())
            .session(session_id)
            .scrubbed(ctx.scrubbed);
        if let Err(e) = result {
            record = record.failed(e);
        }
        audit.log(record)?;

        for warning in ctx.warnings {
            audit.log(
                AuditRecord::new(self.agent_id.as_str(), operation.as_str())
                    .session(session_id)
                    .warning(warning),
            )?;
        }
        Ok(())
    }

    fn manifest(&self, operation: Operation) -> Result<Arc<CapabilityManifest>> {
        self.components
            .manifests
            .get(&self.agent_id)?
            .ok_or_else(|| {
                Error::permission(
                    operation.as_str(),
                    format!("no capability manifest registered for {}", self.agent_id),
                )
            })
    }

    fn owned(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<SessionId>>> {
        self.owned_sessions
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock owned sessions: {}", e)))
    }

    fn is_listed(&self, manifest: &CapabilityManifest, session_id: &SessionId) -> Result<bool> {
        Ok(manifest.allowed_sessions.contains(session_id) || self.owned()?.contains(session_id))
    }

    fn check_readable(&self, manifest: &CapabilityManifest, session_id: &SessionId) -> Result<()> {
        if manifest.scope == Scope::Global || self.is_listed(manifest, session_id)? {
            return Ok(());
        }
        Err(Error::permission(
            "read",
            format!("session {} is outside the scope of {}", session_id, self.agent_id),
        ))
    }

    fn check_writable(&self, manifest: &CapabilityManifest, session_id: &SessionId) -> Result<()> {
        if self.is_listed(manifest, session_id)? {
            return Ok(());
        }
        if manifest.scope == Scope::Global {
            let session = self.components.experiences.get_session(session_id)?;
            if session.agent_id == self.agent_id {
                return Ok(());
            }
        }
        Err(Error::permission(
            "write",
            format!("session {} is outside the scope of {}", session_id, self.agent_id),
        ))
    }

    fn check_knowledge_visible(&self, manifest: &CapabilityManifest, knowledge: &Knowledge) -> Result<()> {
        match self.visible_sessions(manifest)? {
            Some(visible) if !knowledge.is_visible_to(&visible) => Err(Error::permission(
                "read",
                format!("knowledge {} is outside the scope of {}", knowledge.id, self.agent_id),
            )),
            _ => Ok(()),
        }
    }

    fn check_code_path(&self, manifest: &CapabilityManifest, operation: Operation, path: &str) -> Result<()> {
        if manifest.allows_path(path) {
            return Ok(());
        }
        Err(Error::permission(
            operation.as_str(),
            format!("{} is outside the code graph scope of {}", path, self.agent_id),
        ))
    }

    /// Sessions the agent may read; `None` means all of them.
    fn visible_sessions(&self, manifest: &CapabilityManifest) -> Result<Option<BTreeSet<SessionId>>> {
        match manifest.scope {
            Scope::Global => Ok(None),
            Scope::Session => {
                let mut visible = manifest.allowed_sessions.clone();
                visible.extend(self.owned()?.iter().cloned());
                Ok(Some(visible))
            }
        }
    }

    fn scrub(&self, text: &str, ctx: &mut CallContext) -> String {
        let result = self.components.scrubber.scrub(text);
        if result.was_scrubbed() {
            warn!(
                agent_id = %self.agent_id,
                redactions = result.redactions.len(),
                "credentials redacted before persistence"
            );
            ctx.scrubbed = true;
        }
        result.text
    }
}
