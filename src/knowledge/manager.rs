//! Hierarchical memory manager: derives knowledge from experiences and keeps
//! one current head per concept.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::experience::{load_session, Experience, ExperienceId, SessionId};
use crate::graph::{
    timestamp_now, Edge, EdgeType, GraphStore, GraphTx, GraphView, NodeFilter, NodeType,
};
use crate::knowledge::lock::ConceptLocks;
use crate::knowledge::similarity::text_similarity;
use crate::knowledge::types::*;

/// Tunables for extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnowledgeSettings {
    /// Fraction of the remaining distance to 1 gained per reinforcement
    pub reinforcement_rate: f64,
    /// Description similarity below which an `Auto` extraction supersedes the head
    pub contradiction_threshold: f64,
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self {
            reinforcement_rate: 0.5,
            contradiction_threshold: 0.35,
        }
    }
}

/// Confidence after one reinforcement. Monotonically approaches 1.
pub fn reinforce_confidence(confidence: f64, rate: f64) -> f64 {
    (confidence + (1.0 - confidence) * rate).clamp(0.0, 1.0)
}

/// Derives knowledge from experiences and maintains the SUPERSEDES chain.
pub struct HierarchicalMemoryManager {
    graph: Arc<GraphStore>,
    locks: ConceptLocks,
    settings: KnowledgeSettings,
}

impl HierarchicalMemoryManager {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self {
            graph,
            locks: ConceptLocks::default(),
            settings: KnowledgeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: KnowledgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_locks(mut self, locks: ConceptLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn settings(&self) -> &KnowledgeSettings {
        &self.settings
    }

    // ==================== Extraction ====================

    /// Create, reinforce, corroborate or supersede knowledge for a concept.
    ///
    /// The head lookup and the resulting write happen under the concept lock
    /// and inside one write transaction.
    #[instrument(skip(self, request), fields(concept = %request.concept, mode = ?request.mode))]
    pub fn extract_knowledge(&self, request: ExtractionRequest) -> Result<ExtractionOutcome> {
        request.validate()?;
        let _guard = self.locks.acquire(&request.concept)?;

        let outcome = self.graph.write(|tx| {
            let view = tx.view();
            let sources = load_sources(&view, &request.source_experience_ids)?;

            let mut warnings = Vec::new();
            let head = select_head(&view, &request.concept, &mut warnings)?;

            let (knowledge_id, action) = match head {
                None => (self.create(tx, &request, &sources, None)?, ExtractionAction::Created),
                Some(head) => match self.decide(&head, &request) {
                    Decision::Reinforce => {
                        self.reinforce(tx, head.clone(), &request, &sources)?;
                        (head.id, ExtractionAction::Reinforced)
                    }
                    Decision::Corroborate => {
                        self.corroborate(tx, head.clone(), &request, &sources)?;
                        (head.id, ExtractionAction::Corroborated)
                    }
                    Decision::Supersede => {
                        let new_id = self.create(tx, &request, &sources, Some(&head.id))?;
                        (
                            new_id,
                            ExtractionAction::Superseded {
                                previous: head.id,
                            },
                        )
                    }
                },
            };

            Ok(ExtractionOutcome {
                knowledge_id,
                action,
                warnings,
            })
        })?;

        for warning in &outcome.warnings {
            warn!(concept = %request.concept, "{}", warning);
        }
        info!(knowledge_id = %outcome.knowledge_id, action = ?outcome.action, "knowledge extracted");
        Ok(outcome)
    }

    fn decide(&self, head: &Knowledge, request: &ExtractionRequest) -> Decision {
        match request.mode {
            ExtractionMode::Reinforce => Decision::Reinforce,
            ExtractionMode::Update => Decision::Supersede,
            ExtractionMode::Auto => {
                let similarity = text_similarity(&head.description, &request.description);
                debug!(similarity, "compared against current head");
                if similarity < self.settings.contradiction_threshold {
                    Decision::Supersede
                } else if request.confidence >= head.confidence {
                    Decision::Reinforce
                } else {
                    Decision::Corroborate
                }
            }
        }
    }

    fn create(
        &self,
        tx: &GraphTx<'_>,
        request: &ExtractionRequest,
        sources: &[Experience],
        supersedes: Option<&KnowledgeId>,
    ) -> Result<KnowledgeId> {
        let now = timestamp_now();
        let knowledge = Knowledge {
            id: KnowledgeId::new(),
            concept: request.concept.clone(),
            description: request.description.clone(),
            confidence: request.confidence,
            reuse_count: 0,
            source_experience_ids: dedup_ids(sources.iter().map(|e| e.id.clone())),
            source_session_ids: sources.iter().map(|e| e.session_id.clone()).collect(),
            created_at: now,
            last_reinforced_at: now,
            contains_redacted_credentials: request.contains_redacted_credentials,
        };

        tx.create_node(&knowledge.to_node())?;
        link_sources(tx, &knowledge.id, sources.iter().map(|e| &e.id))?;
        if let Some(previous) = supersedes {
            tx.create_edge(&Edge::new(
                EdgeType::Supersedes,
                knowledge.id.node_id(),
                previous.node_id(),
            ))?;
        }
        Ok(knowledge.id)
    }

    fn reinforce(
        &self,
        tx: &GraphTx<'_>,
        mut head: Knowledge,
        request: &ExtractionRequest,
        sources: &[Experience],
    ) -> Result<()> {
        head.confidence = reinforce_confidence(head.confidence, self.settings.reinforcement_rate);
        head.reuse_count += 1;
        head.last_reinforced_at = timestamp_now().max(head.last_reinforced_at);
        self.merge_sources(tx, head, request, sources)
    }

    fn corroborate(
        &self,
        tx: &GraphTx<'_>,
        head: Knowledge,
        request: &ExtractionRequest,
        sources: &[Experience],
    ) -> Result<()> {
        self.merge_sources(tx, head, request, sources)
    }

    fn merge_sources(
        &self,
        tx: &GraphTx<'_>,
        mut head: Knowledge,
        request: &ExtractionRequest,
        sources: &[Experience],
    ) -> Result<()> {
        let known: HashSet<ExperienceId> = head.source_experience_ids.iter().cloned().collect();
        let fresh: Vec<&Experience> = sources.iter().filter(|e| !known.contains(&e.id)).collect();

        head.source_experience_ids = dedup_ids(
            head.source_experience_ids
                .iter()
                .cloned()
                .chain(fresh.iter().map(|e| e.id.clone())),
        );
        head.source_session_ids
            .extend(fresh.iter().map(|e| e.session_id.clone()));
        head.contains_redacted_credentials |= request.contains_redacted_credentials;

        link_sources(tx, &head.id, fresh.iter().map(|e| &e.id))?;
        tx.update_attributes(&head.id.node_id(), head.attributes())?;
        Ok(())
    }

    // ==================== Reuse ====================

    /// Record that a session applied a piece of knowledge.
    #[instrument(skip(self), fields(session_id = %session_id, knowledge_id = %knowledge_id))]
    pub fn apply_knowledge(
        &self,
        session_id: &SessionId,
        knowledge_id: &KnowledgeId,
    ) -> Result<Knowledge> {
        self.graph.write(|tx| {
            let view = tx.view();
            let session = load_session(&view, session_id)?;
            if session.is_finalized() {
                return Err(Error::invalid_state(
                    "session",
                    session_id,
                    "cannot apply knowledge in a finalized session",
                ));
            }
            let mut knowledge = load_knowledge(&view, knowledge_id)?;

            tx.create_edge(&Edge::new(
                EdgeType::AppliedKnowledge,
                session_id.node_id(),
                knowledge_id.node_id(),
            ))?;
            knowledge.reuse_count += 1;
            tx.update_attributes(&knowledge_id.node_id(), knowledge.attributes())?;
            Ok(knowledge)
        })
    }

    // ==================== Lookup ====================

    /// Get knowledge by ID.
    pub fn get_knowledge(&self, id: &KnowledgeId) -> Result<Knowledge> {
        self.graph.read(|view| load_knowledge(view, id))
    }

    /// The current head for a concept, if any.
    pub fn current_head(&self, concept: &str) -> Result<Option<Knowledge>> {
        self.graph
            .read(|view| select_head(view, concept, &mut Vec::new()))
    }

    /// All current heads, oldest first.
    pub fn heads(&self) -> Result<Vec<Knowledge>> {
        self.graph.read(|view| {
            view.find_nodes(
                &NodeFilter::of_type(NodeType::Knowledge).without_incoming(EdgeType::Supersedes),
            )?
            .iter()
            .map(Knowledge::from_node)
            .collect()
        })
    }

    /// The node that directly supersedes `id`, if any.
    pub fn superseded_by(&self, id: &KnowledgeId) -> Result<Option<KnowledgeId>> {
        self.graph.read(|view| {
            view.require_node(&id.node_id(), NodeType::Knowledge)?;
            superseding(view, id)
        })
    }

    /// The version chain containing `id`, newest first.
    pub fn history(&self, id: &KnowledgeId) -> Result<Vec<Knowledge>> {
        self.graph.read(|view| {
            view.require_node(&id.node_id(), NodeType::Knowledge)?;

            let mut seen: HashSet<KnowledgeId> = HashSet::new();
            let mut newest = id.clone();
            seen.insert(newest.clone());
            while let Some(next) = superseding(view, &newest)? {
                if !seen.insert(next.clone()) {
                    return Err(Error::Corruption(format!(
                        "supersedes cycle through knowledge {}",
                        next
                    )));
                }
                newest = next;
            }

            let mut chain = Vec::new();
            let mut cursor = Some(newest);
            seen.clear();
            while let Some(current) = cursor {
                if !seen.insert(current.clone()) {
                    return Err(Error::Corruption(format!(
                        "supersedes cycle through knowledge {}",
                        current
                    )));
                }
                chain.push(load_knowledge(view, &current)?);
                cursor = view
                    .edges_from(&current.node_id(), Some(EdgeType::Supersedes))?
                    .pop()
                    .map(|edge| KnowledgeId::from(edge.to));
            }
            Ok(chain)
        })
    }

    // ==================== Aggregates ====================

    /// Knowledge statistics, optionally restricted to knowledge derived from
    /// some sessions.
    pub fn summary(&self, visible: Option<&BTreeSet<SessionId>>) -> Result<KnowledgeSummary> {
        self.graph.read(|view| {
            let head_ids: HashSet<KnowledgeId> = view
                .find_nodes(
                    &NodeFilter::of_type(NodeType::Knowledge)
                        .without_incoming(EdgeType::Supersedes),
                )?
                .into_iter()
                .map(|node| KnowledgeId::from(node.id))
                .collect();

            let mut summary = KnowledgeSummary::default();
            let mut head_confidence = 0.0;
            for node in view.find_nodes(&NodeFilter::of_type(NodeType::Knowledge))? {
                let knowledge = Knowledge::from_node(&node)?;
                if let Some(sessions) = visible {
                    if !knowledge.is_visible_to(sessions) {
                        continue;
                    }
                }

                let is_head = head_ids.contains(&knowledge.id);
                let concept = summary.concepts.entry(knowledge.concept.clone()).or_default();
                concept.versions += 1;
                summary.total += 1;
                if is_head {
                    concept.heads += 1;
                    concept.reuse_count += knowledge.reuse_count;
                    summary.heads += 1;
                    head_confidence += knowledge.confidence;
                } else {
                    summary.superseded += 1;
                }
            }
            if summary.heads > 0 {
                summary.average_confidence = head_confidence / summary.heads as f64;
            }
            Ok(summary)
        })
    }
}

enum Decision {
    Reinforce,
    Corroborate,
    Supersede,
}

/// Per-concept counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptSummary {
    /// Current heads (1 unless a tie-break is pending)
    pub heads: u64,
    /// All versions, superseded ones included
    pub versions: u64,
    pub reuse_count: u64,
}

/// Aggregate knowledge statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSummary {
    pub total: u64,
    pub heads: u64,
    pub superseded: u64,
    /// Mean confidence over heads
    pub average_confidence: f64,
    pub concepts: BTreeMap<String, ConceptSummary>,
}

fn load_knowledge(view: &GraphView<'_>, id: &KnowledgeId) -> Result<Knowledge> {
    let node = view.require_node(&id.node_id(), NodeType::Knowledge)?;
    Knowledge::from_node(&node)
}

fn superseding(view: &GraphView<'_>, id: &KnowledgeId) -> Result<Option<KnowledgeId>> {
    Ok(view
        .edges_to(&id.node_id(), Some(EdgeType::Supersedes))?
        .pop()
        .map(|edge| KnowledgeId::from(edge.from)))
}

/// Pick the head for a concept. Several heads should not exist; if they do,
/// the most recently reinforced one wins and a warning is recorded.
fn select_head(
    view: &GraphView<'_>,
    concept: &str,
    warnings: &mut Vec<String>,
) -> Result<Option<Knowledge>> {
    let mut heads = view
        .find_nodes(
            &NodeFilter::of_type(NodeType::Knowledge)
                .attr("concept", concept)
                .without_incoming(EdgeType::Supersedes),
        )?
        .iter()
        .map(Knowledge::from_node)
        .collect::<Result<Vec<_>>>()?;

    if heads.len() > 1 {
        warnings.push(format!(
            "{} current heads for concept '{}'; using the most recently reinforced",
            heads.len(),
            concept
        ));
    }

    heads.sort_by(|a, b| {
        a.last_reinforced_at
            .cmp(&b.last_reinforced_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(heads.pop())
}

fn load_sources(view: &GraphView<'_>, ids: &[ExperienceId]) -> Result<Vec<Experience>> {
    ids.iter()
        .map(|id| {
            let node = view.require_node(&id.node_id(), NodeType::Experience)?;
            Experience::from_node(&node)
        })
        .collect()
}

fn link_sources<'a>(
    tx: &GraphTx<'_>,
    knowledge_id: &KnowledgeId,
    sources: impl IntoIterator<Item = &'a ExperienceId>,
) -> Result<()> {
    let mut linked = HashSet::new();
    for source in sources {
        if linked.insert(source.clone()) {
            tx.create_edge(&Edge::new(
                EdgeType::ExtractedKnowledge,
                source.node_id(),
                knowledge_id.node_id(),
            ))?;
        }
    }
    Ok(())
}

fn dedup_ids(ids: impl IntoIterator<Item = ExperienceId>) -> Vec<ExperienceId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::{AgentId, ExperienceStore, ExperienceType};
    use pretty_assertions::assert_eq;

    struct Fixture {
        experiences: ExperienceStore,
        manager: HierarchicalMemoryManager,
        session: SessionId,
    }

    fn fixture() -> Fixture {
        let graph = Arc::new(GraphStore::in_memory().unwrap());
        let experiences = ExperienceStore::new(Arc::clone(&graph));
        let session = experiences
            .start_session(&AgentId::new("agent"), "harden queries")
            .unwrap()
            .id;
        Fixture {
            experiences,
            manager: HierarchicalMemoryManager::new(graph),
            session,
        }
    }

    impl Fixture {
        fn experience(&self, content: &str) -> ExperienceId {
            self.experiences
                .record_experience(&self.session, ExperienceType::Observation, content, Vec::<String>::new())
                .unwrap()
                .id
        }
    }

    #[test]
    fn test_reinforce_confidence_formula() {
        assert!((reinforce_confidence(0.8, 0.5) - 0.9).abs() < 1e-12);
        assert_eq!(reinforce_confidence(1.0, 0.5), 1.0);
        assert_eq!(reinforce_confidence(0.0, 0.5), 0.5);
    }

    #[test]
    fn test_create_then_reinforce() {
        let f = fixture();
        let e1 = f.experience("query built by string concat");

        let first = f
            .manager
            .extract_knowledge(ExtractionRequest::new(
                "sql-injection",
                "string concat in queries is risky",
                vec![e1.clone()],
                0.8,
            ))
            .unwrap();
        assert_eq!(first.action, ExtractionAction::Created);

        let second = f
            .manager
            .extract_knowledge(
                ExtractionRequest::new(
                    "sql-injection",
                    "string concat in queries is risky",
                    vec![e1],
                    0.8,
                )
                .reinforcing(),
            )
            .unwrap();
        assert_eq!(second.action, ExtractionAction::Reinforced);
        assert_eq!(second.knowledge_id, first.knowledge_id);

        let head = f.manager.current_head("sql-injection").unwrap().unwrap();
        assert!((head.confidence - 0.9).abs() < 1e-12);
        assert_eq!(head.reuse_count, 1);
        assert_eq!(head.source_experience_ids.len(), 1);
        assert!(head.last_reinforced_at >= head.created_at);
    }

    #[test]
    fn test_update_supersedes_and_keeps_history() {
        let f = fixture();
        let e1 = f.experience("concat observed");
        let e2 = f.experience("parameters fixed it");

        let old = f
            .manager
            .extract_knowledge(ExtractionRequest::new("sql-injection", "string concat in queries is risky", vec![e1], 0.8))
            .unwrap();
        let new = f
            .manager
            .extract_knowledge(
                ExtractionRequest::new("sql-injection", "always use parameterized statements", vec![e2], 0.7)
                    .updating(),
            )
            .unwrap();

        assert_eq!(
            new.action,
            ExtractionAction::Superseded {
                previous: old.knowledge_id.clone()
            }
        );
        assert_eq!(f.manager.heads().unwrap().len(), 1);
        assert_eq!(
            f.manager.superseded_by(&old.knowledge_id).unwrap(),
            Some(new.knowledge_id.clone())
        );

        let history = f.manager.history(&old.knowledge_id).unwrap();
        let ids: Vec<_> = history.iter().map(|k| k.id.clone()).collect();
        assert_eq!(ids, vec![new.knowledge_id, old.knowledge_id.clone()]);
        assert_eq!(history[1].confidence, 0.8);
    }

    #[test]
    fn test_auto_mode_decisions() {
        let f = fixture();
        let e1 = f.experience("one");
        let base = "string concat in queries is risky";

        f.manager
            .extract_knowledge(ExtractionRequest::new("sqli", base, vec![e1.clone()], 0.6))
            .unwrap();

        let lower = f
            .manager
            .extract_knowledge(ExtractionRequest::new("sqli", base, vec![f.experience("two")], 0.2))
            .unwrap();
        assert_eq!(lower.action, ExtractionAction::Corroborated);
        let head = f.manager.current_head("sqli").unwrap().unwrap();
        assert_eq!(head.confidence, 0.6);
        assert_eq!(head.source_experience_ids.len(), 2);

        let agree = f
            .manager
            .extract_knowledge(ExtractionRequest::new("sqli", base, vec![e1.clone()], 0.6))
            .unwrap();
        assert_eq!(agree.action, ExtractionAction::Reinforced);

        let diverge = f
            .manager
            .extract_knowledge(ExtractionRequest::new(
                "sqli",
                "prepared statements with bound parameters",
                vec![e1],
                0.5,
            ))
            .unwrap();
        assert!(matches!(diverge.action, ExtractionAction::Superseded { .. }));
    }

    #[test]
    fn test_unknown_source_is_not_found() {
        let f = fixture();
        let err = f
            .manager
            .extract_knowledge(ExtractionRequest::new("c", "d", vec![ExperienceId::new()], 0.5))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "experience", .. }));
        assert!(f.manager.heads().unwrap().is_empty());
    }

    #[test]
    fn test_busy_concept_is_a_conflict_and_writes_nothing() {
        let graph = Arc::new(GraphStore::in_memory().unwrap());
        let experiences = ExperienceStore::new(Arc::clone(&graph));
        let session = experiences
            .start_session(&AgentId::new("agent"), "harden queries")
            .unwrap()
            .id;
        let source = experiences
            .record_experience(&session, ExperienceType::Observation, "concat again", Vec::<String>::new())
            .unwrap()
            .id;
        let locks = ConceptLocks::new(0, std::time::Duration::from_millis(1));
        let manager = HierarchicalMemoryManager::new(graph).with_locks(locks.clone());

        let held = locks.acquire("sql-injection").unwrap();
        let err = manager
            .extract_knowledge(ExtractionRequest::new(
                "sql-injection",
                "string concat in queries is risky",
                vec![source.clone()],
                0.8,
            ))
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));
        assert!(manager.heads().unwrap().is_empty());

        drop(held);
        let outcome = manager
            .extract_knowledge(ExtractionRequest::new(
                "sql-injection",
                "string concat in queries is risky",
                vec![source],
                0.8,
            ))
            .unwrap();
        assert_eq!(outcome.action, ExtractionAction::Created);
    }

    #[test]
    fn test_multiple_heads_prefers_most_recent_and_warns() {
        let f = fixture();
        let e1 = f.experience("one");

        let first = f
            .manager
            .extract_knowledge(ExtractionRequest::new("dup", "first description", vec![e1.clone()], 0.5))
            .unwrap();

        // Inject a second head behind the manager's back.
        let mut rogue = f.manager.get_knowledge(&first.knowledge_id).unwrap();
        rogue.id = KnowledgeId::new();
        rogue.last_reinforced_at = timestamp_now() + chrono::Duration::seconds(1);
        f.manager
            .graph
            .write(|tx| tx.create_node(&rogue.to_node()).map(|_| ()))
            .unwrap();

        let outcome = f
            .manager
            .extract_knowledge(ExtractionRequest::new("dup", "first description", vec![e1], 0.5).reinforcing())
            .unwrap();
        assert_eq!(outcome.knowledge_id, rogue.id);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_apply_knowledge_counts_reuse() {
        let f = fixture();
        let e1 = f.experience("one");
        let k = f
            .manager
            .extract_knowledge(ExtractionRequest::new("c", "d", vec![e1], 0.5))
            .unwrap()
            .knowledge_id;

        let applied = f.manager.apply_knowledge(&f.session, &k).unwrap();
        assert_eq!(applied.reuse_count, 1);

        let stats = f.manager.graph.stats().unwrap();
        assert_eq!(stats.edges(EdgeType::AppliedKnowledge), 1);
    }

    #[test]
    fn test_summary_filters_by_session() {
        let f = fixture();
        let e1 = f.experience("one");
        f.manager
            .extract_knowledge(ExtractionRequest::new("a", "alpha beta", vec![e1.clone()], 0.4))
            .unwrap();
        f.manager
            .extract_knowledge(ExtractionRequest::new("a", "gamma delta", vec![e1], 0.6).updating())
            .unwrap();

        let all = f.manager.summary(None).unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.heads, 1);
        assert_eq!(all.superseded, 1);
        assert!((all.average_confidence - 0.6).abs() < 1e-12);
        assert_eq!(all.concepts["a"].versions, 2);

        let nobody = f.manager.summary(Some(&BTreeSet::new())).unwrap();
        assert_eq!(nobody.total, 0);
    }
}
