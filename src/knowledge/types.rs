//! Knowledge records and extraction requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::experience::{expect_type, node_backed_id, ExperienceId, SessionId, REDACTED_TAG};
use crate::graph::{parse_timestamp, Attributes, Node, NodeType};

node_backed_id!(
    /// Unique identifier for a knowledge node.
    KnowledgeId
);

/// A durable belief synthesized from one or more experiences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knowledge {
    pub id: KnowledgeId,
    /// Short label; versions of the same belief share it
    pub concept: String,
    pub description: String,
    /// Always within [0, 1]
    pub confidence: f64,
    pub reuse_count: u64,
    pub source_experience_ids: Vec<ExperienceId>,
    /// Sessions the source experiences came from
    pub source_session_ids: BTreeSet<SessionId>,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    pub contains_redacted_credentials: bool,
}

impl Knowledge {
    /// Whether any source experience came from one of `sessions`.
    pub fn is_visible_to(&self, sessions: &BTreeSet<SessionId>) -> bool {
        self.source_session_ids.iter().any(|s| sessions.contains(s))
    }

    pub(crate) fn to_node(&self) -> Node {
        let mut node = Node::new(NodeType::Knowledge);
        node.id = self.id.node_id();
        node.created_at = self.created_at;
        node.updated_at = self.last_reinforced_at;
        node.attributes = self.attributes();
        node
    }

    pub(crate) fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("concept".into(), json!(self.concept));
        attrs.insert("description".into(), json!(self.description));
        attrs.insert("confidence".into(), json!(self.confidence));
        attrs.insert("reuse_count".into(), json!(self.reuse_count));
        attrs.insert(
            "source_experience_ids".into(),
            json!(self.source_experience_ids),
        );
        attrs.insert("source_session_ids".into(), json!(self.source_session_ids));
        attrs.insert("last_reinforced_at".into(), json!(self.last_reinforced_at));
        attrs.insert(
            REDACTED_TAG.into(),
            Value::Bool(self.contains_redacted_credentials),
        );
        attrs
    }

    pub(crate) fn from_node(node: &Node) -> Result<Self> {
        expect_type(node, NodeType::Knowledge)?;
        let confidence = node.attr_f64("confidence").ok_or_else(|| {
            Error::Corruption(format!("knowledge {} has no confidence", node.id))
        })?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::Corruption(format!(
                "knowledge {} has confidence {} outside [0, 1]",
                node.id, confidence
            )));
        }

        Ok(Self {
            id: node.id.clone().into(),
            concept: node.require_str("concept")?.to_string(),
            description: node.require_str("description")?.to_string(),
            confidence,
            reuse_count: node.attr_u64("reuse_count").unwrap_or(0),
            source_experience_ids: node.attr_as("source_experience_ids")?.unwrap_or_default(),
            source_session_ids: node.attr_as("source_session_ids")?.unwrap_or_default(),
            created_at: node.created_at,
            last_reinforced_at: parse_timestamp(node.require_str("last_reinforced_at")?)?,
            contains_redacted_credentials: node.attr_bool(REDACTED_TAG).unwrap_or(false),
        })
    }
}

/// How an extraction relates to an existing head for the same concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Decide from description similarity and confidence
    #[default]
    Auto,
    /// The caller asserts the description reinforces the head
    Reinforce,
    /// The caller asserts the description replaces the head
    Update,
}

/// Input to [`HierarchicalMemoryManager::extract_knowledge`](super::HierarchicalMemoryManager::extract_knowledge).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub concept: String,
    pub description: String,
    pub source_experience_ids: Vec<ExperienceId>,
    pub confidence: f64,
    pub mode: ExtractionMode,
    /// Set when the concept or description had credentials redacted
    pub contains_redacted_credentials: bool,
}

impl ExtractionRequest {
    pub fn new(
        concept: impl Into<String>,
        description: impl Into<String>,
        source_experience_ids: Vec<ExperienceId>,
        confidence: f64,
    ) -> Self {
        Self {
            concept: concept.into(),
            description: description.into(),
            source_experience_ids,
            confidence,
            mode: ExtractionMode::Auto,
            contains_redacted_credentials: false,
        }
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn reinforcing(self) -> Self {
        self.with_mode(ExtractionMode::Reinforce)
    }

    pub fn updating(self) -> Self {
        self.with_mode(ExtractionMode::Update)
    }

    /// Reject malformed requests before touching the store.
    pub fn validate(&self) -> Result<()> {
        if self.concept.trim().is_empty() {
            return Err(Error::validation("concept must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(Error::validation("description must not be empty"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::validation(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        if self.source_experience_ids.is_empty() {
            return Err(Error::validation(
                "knowledge needs at least one source experience",
            ));
        }
        Ok(())
    }
}

/// What an extraction did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExtractionAction {
    /// No head existed; a new one was created
    Created,
    /// The head's confidence and reuse count were raised in place
    Reinforced,
    /// Sources were linked to the head without changing its confidence
    Corroborated,
    /// A new head replaced `previous`
    Superseded { previous: KnowledgeId },
}

/// Result of an extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    /// The head for the concept after the extraction
    pub knowledge_id: KnowledgeId,
    pub action: ExtractionAction,
    /// Anomalies handled along the way (e.g. several heads for one concept)
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(confidence: f64) -> ExtractionRequest {
        ExtractionRequest::new("sql-injection", "concat is risky", vec![ExperienceId::new()], confidence)
    }

    #[test]
    fn test_validate_confidence_bounds() {
        assert!(request(0.0).validate().is_ok());
        assert!(request(1.0).validate().is_ok());
        assert!(matches!(request(1.01).validate(), Err(Error::Validation(_))));
        assert!(matches!(request(-0.1).validate(), Err(Error::Validation(_))));
        assert!(matches!(request(f64::NAN).validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_requires_sources_and_text() {
        let mut req = request(0.5);
        req.source_experience_ids.clear();
        assert!(req.validate().is_err());

        let req = ExtractionRequest::new(" ", "d", vec![ExperienceId::new()], 0.5);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_knowledge_node_round_trip() {
        let now = crate::graph::timestamp_now();
        let knowledge = Knowledge {
            id: KnowledgeId::new(),
            concept: "c".into(),
            description: "d".into(),
            confidence: 0.8,
            reuse_count: 2,
            source_experience_ids: vec![ExperienceId::new(), ExperienceId::new()],
            source_session_ids: [SessionId::new()].into_iter().collect(),
            created_at: now,
            last_reinforced_at: now,
            contains_redacted_credentials: true,
        };
        assert_eq!(Knowledge::from_node(&knowledge.to_node()).unwrap(), knowledge);
    }

    #[test]
    fn test_out_of_range_confidence_is_corruption() {
        let node = Node::new(NodeType::Knowledge)
            .with_attr("concept", "c")
            .with_attr("description", "d")
            .with_attr("confidence", 1.5);
        assert!(matches!(Knowledge::from_node(&node), Err(Error::Corruption(_))));
    }
}
