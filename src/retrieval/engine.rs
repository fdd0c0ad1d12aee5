//! Ranked retrieval over knowledge, experiences and code structure.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::code::{CodeContext, CodeEntity};
use crate::error::{Error, Result};
use crate::experience::{Experience, SessionId};
use crate::graph::{
    CostMeter, Direction, EdgeType, GraphStore, GraphView, Match, NodeFilter, NodeSelector,
    NodeType, Pattern, QueryLimits,
};
use crate::knowledge::similarity::TermVector;
use crate::knowledge::{Knowledge, KnowledgeId};

/// Parameters for [`RetrievalEngine::retrieve_knowledge`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub text: String,
    pub top_k: usize,
    pub min_similarity: f64,
    /// Also rank superseded versions
    pub include_history: bool,
    /// Only knowledge derived from these sessions (None means all)
    pub visible_sessions: Option<BTreeSet<SessionId>>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: 5,
            min_similarity: 0.0,
            include_history: false,
            visible_sessions: None,
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn min_similarity(mut self, min_similarity: f64) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn include_history(mut self, include: bool) -> Self {
        self.include_history = include;
        self
    }

    pub fn visible_sessions(mut self, sessions: BTreeSet<SessionId>) -> Self {
        self.visible_sessions = Some(sessions);
        self
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(Error::validation(format!(
                "min_similarity must be within [0, 1], got {}",
                self.min_similarity
            )));
        }
        Ok(())
    }
}

/// Whether a ranked result is the authoritative version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KnowledgeStatus {
    Current,
    Superseded { by: KnowledgeId },
}

/// A knowledge node with its ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedKnowledge {
    pub knowledge: Knowledge,
    pub similarity: f64,
    /// similarity * confidence * recency weight
    pub score: f64,
    pub status: KnowledgeStatus,
}

impl RankedKnowledge {
    pub fn is_current(&self) -> bool {
        self.status == KnowledgeStatus::Current
    }
}

/// An experience with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedExperience {
    pub experience: Experience,
    pub similarity: f64,
}

/// Read-only ranking over the memory graph.
pub struct RetrievalEngine {
    graph: Arc<GraphStore>,
    half_life: Duration,
}

impl RetrievalEngine {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self {
            graph,
            half_life: Duration::days(30),
        }
    }

    /// Age at which a knowledge node's recency weight drops to one half.
    pub fn with_half_life(mut self, half_life: Duration) -> Self {
        self.half_life = half_life;
        self
    }

    /// Exponential recency weight in (0, 1].
    pub fn recency_weight(&self, last_reinforced_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let half_life = self.half_life.num_milliseconds();
        if half_life <= 0 {
            return 1.0;
        }
        let age = (now - last_reinforced_at).num_milliseconds().max(0);
        0.5f64.powf(age as f64 / half_life as f64)
    }

    // ==================== Knowledge ====================

    /// Rank knowledge against free text.
    ///
    /// Only current heads are eligible unless `include_history` is set.
    /// Each candidate examined costs one unit against `limits`, and no more
    /// candidates are loaded than the budget can pay for.
    #[instrument(skip(self, query, limits), fields(top_k = query.top_k, history = query.include_history))]
    pub fn retrieve_knowledge(
        &self,
        query: &RetrievalQuery,
        limits: &QueryLimits,
    ) -> Result<Vec<RankedKnowledge>> {
        query.validate()?;
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let needle = TermVector::new(&query.text);
        let now = Utc::now();

        let mut ranked = self.graph.read(|view| {
            let mut meter = limits.meter();
            let mut filter = NodeFilter::of_type(NodeType::Knowledge).limit(meter.row_limit());
            if !query.include_history {
                filter = filter.without_incoming(EdgeType::Supersedes);
            }
            let candidates = view.find_nodes(&filter)?;

            let mut ranked = Vec::new();
            for node in candidates {
                meter.charge(1)?;
                let knowledge = Knowledge::from_node(&node)?;
                if let Some(sessions) = &query.visible_sessions {
                    if !knowledge.is_visible_to(sessions) {
                        continue;
                    }
                }

                let haystack =
                    TermVector::new(&format!("{} {}", knowledge.concept, knowledge.description));
                let similarity = needle.cosine(&haystack);
                if similarity <= 0.0 || similarity < query.min_similarity {
                    continue;
                }

                let status = if query.include_history {
                    knowledge_status(view, &knowledge.id, &mut meter)?
                } else {
                    KnowledgeStatus::Current
                };
                let score = similarity
                    * knowledge.confidence
                    * self.recency_weight(knowledge.last_reinforced_at, now);
                ranked.push(RankedKnowledge {
                    knowledge,
                    similarity,
                    score,
                    status,
                });
            }
            debug!(spent = meter.spent(), candidates = ranked.len(), "knowledge ranked");
            Ok(ranked)
        })?;

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.knowledge.last_reinforced_at.cmp(&a.knowledge.last_reinforced_at))
                .then_with(|| a.knowledge.id.cmp(&b.knowledge.id))
        });
        ranked.truncate(query.top_k);
        Ok(ranked)
    }

    // ==================== Experiences ====================

    /// Rank experiences by content similarity, newest first on ties.
    pub fn search_experiences(
        &self,
        text: &str,
        top_k: usize,
        visible_sessions: Option<&BTreeSet<SessionId>>,
        limits: &QueryLimits,
    ) -> Result<Vec<RankedExperience>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let needle = TermVector::new(text);

        let mut ranked = self.graph.read(|view| {
            let mut meter = limits.meter();
            let filters: Vec<NodeFilter> = match visible_sessions {
                None => vec![NodeFilter::of_type(NodeType::Experience)],
                Some(sessions) => sessions
                    .iter()
                    .map(|session| {
                        NodeFilter::of_type(NodeType::Experience)
                            .attr("session_id", session.to_string())
                    })
                    .collect(),
            };

            let mut ranked = Vec::new();
            for filter in filters {
                if visible_sessions.is_some() {
                    meter.charge(1)?;
                }
                for node in view.find_nodes(&filter.limit(meter.row_limit()))? {
                    meter.charge(1)?;
                    let experience = Experience::from_node(&node)?;
                    let similarity = needle.cosine(&TermVector::new(&experience.content));
                    if similarity > 0.0 {
                        ranked.push(RankedExperience {
                            experience,
                            similarity,
                        });
                    }
                }
            }
            Ok(ranked)
        })?;

        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.experience.created_at.cmp(&a.experience.created_at))
        });
        ranked.truncate(top_k);
        Ok(ranked)
    }

    // ==================== Code Context ====================

    /// Structural neighbourhood of a file: what it contains, what it imports,
    /// what imports it and the call edges between their functions.
    #[instrument(skip(self, limits))]
    pub fn query_code_context(
        &self,
        file_path: &str,
        max_depth: u32,
        limits: &QueryLimits,
    ) -> Result<CodeContext> {
        let pattern = Pattern::from(NodeSelector::Attr {
            node_type: NodeType::File,
            key: "path".to_string(),
            value: json!(file_path),
        })
        .follow(vec![EdgeType::Contains, EdgeType::Imports, EdgeType::Calls])
        .direction(Direction::Both);
        let limits = QueryLimits {
            max_depth,
            ..*limits
        };

        let matches = self.graph.read(|view| view.query(&pattern, &limits))?;
        let mut entities = matches.iter().map(code_entity);
        let root = entities
            .next()
            .ok_or_else(|| Error::not_found("file", file_path))?;
        Ok(CodeContext {
            root,
            entities: entities.collect(),
        })
    }
}

fn knowledge_status(
    view: &GraphView<'_>,
    id: &KnowledgeId,
    meter: &mut CostMeter,
) -> Result<KnowledgeStatus> {
    meter.charge(1)?;
    let status = match view.edges_to(&id.node_id(), Some(EdgeType::Supersedes))?.pop() {
        Some(edge) => KnowledgeStatus::Superseded {
            by: KnowledgeId::from(edge.from),
        },
        None => KnowledgeStatus::Current,
    };
    Ok(status)
}

fn code_entity(m: &Match) -> CodeEntity {
    let path = m.node.attr_str("path").unwrap_or_default().to_string();
    let name = m
        .node
        .attr_str("qualified_name")
        .or_else(|| m.node.attr_str("name"))
        .unwrap_or(path.as_str())
        .to_string();
    CodeEntity {
        node_id: m.node.id.clone(),
        kind: m.node.node_type,
        name,
        path,
        depth: m.depth,
        relation: m.via.as_ref().map(|edge| edge.edge_type),
    }
}
