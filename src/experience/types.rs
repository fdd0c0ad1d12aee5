//! Session and experience records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::graph::{parse_timestamp, Attributes, Node, NodeType};

/// Tag attached to records whose text had credentials redacted.
pub const REDACTED_TAG: &str = "contains_redacted_credentials";

/// Declares a UUID-backed identifier that maps 1:1 onto a graph node.
macro_rules! node_backed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub ::uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(::uuid::Uuid::new_v4())
            }

            pub fn parse(s: &str) -> std::result::Result<Self, ::uuid::Error> {
                Ok(Self(::uuid::Uuid::parse_str(s)?))
            }

            /// The graph node backing this record.
            pub fn node_id(&self) -> $crate::graph::NodeId {
                $crate::graph::NodeId(self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<$crate::graph::NodeId> for $name {
            fn from(id: $crate::graph::NodeId) -> Self {
                Self(id.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

pub(crate) use node_backed_id;

node_backed_id!(
    /// Unique identifier for a session.
    SessionId
);

node_backed_id!(
    /// Unique identifier for an experience.
    ExperienceId
);

/// Caller-chosen agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of episodic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceType {
    Action,
    Outcome,
    Observation,
}

impl ExperienceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Outcome => "outcome",
            Self::Observation => "observation",
        }
    }
}

impl std::fmt::Display for ExperienceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperienceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "action" => Ok(Self::Action),
            "outcome" => Ok(Self::Outcome),
            "observation" => Ok(Self::Observation),
            other => Err(Error::validation(format!("unknown experience type '{}'", other))),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub outcome: String,
    pub success: bool,
    pub metrics: BTreeMap<String, f64>,
}

impl SessionOutcome {
    pub fn new(outcome: impl Into<String>, success: bool) -> Self {
        Self {
            outcome: outcome.into(),
            success,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// One bounded run of an agent pursuing a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub goal: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
    pub success: Option<bool>,
    pub metrics: BTreeMap<String, f64>,
    pub contains_redacted_credentials: bool,
}

impl Session {
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    pub(crate) fn to_node(&self) -> Node {
        let mut node = Node::new(NodeType::Session);
        node.id = self.id.node_id();
        node.created_at = self.start_time;
        node.updated_at = self.start_time;
        node.attributes = self.attributes();
        node
    }

    pub(crate) fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("agent_id".into(), json!(self.agent_id));
        attrs.insert("goal".into(), json!(self.goal));
        attrs.insert("start_time".into(), json!(self.start_time));
        attrs.insert("end_time".into(), json!(self.end_time));
        attrs.insert("outcome".into(), json!(self.outcome));
        attrs.insert("success".into(), json!(self.success));
        attrs.insert("metrics".into(), json!(self.metrics));
        attrs.insert(
            REDACTED_TAG.into(),
            Value::Bool(self.contains_redacted_credentials),
        );
        attrs
    }

    pub(crate) fn from_node(node: &Node) -> Result<Self> {
        expect_type(node, NodeType::Session)?;
        Ok(Self {
            id: node.id.clone().into(),
            agent_id: AgentId::new(node.require_str("agent_id")?),
            goal: node.require_str("goal")?.to_string(),
            start_time: parse_timestamp(node.require_str("start_time")?)?,
            end_time: node.attr_as("end_time")?,
            outcome: node.attr_as("outcome")?,
            success: node.attr_as("success")?,
            metrics: node.attr_as("metrics")?.unwrap_or_default(),
            contains_redacted_credentials: node.attr_bool(REDACTED_TAG).unwrap_or(false),
        })
    }
}

/// An immutable record of one action, outcome or observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: ExperienceId,
    pub session_id: SessionId,
    pub experience_type: ExperienceType,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    /// Position within the session, starting at 1
    pub sequence: u64,
}

impl Experience {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub(crate) fn to_node(&self) -> Node {
        let mut node = Node::new(NodeType::Experience)
            .with_attr("session_id", self.session_id.to_string())
            .with_attr("type", self.experience_type.as_str())
            .with_attr("content", self.content.clone())
            .with_attr("tags", json!(self.tags))
            .with_attr("sequence", self.sequence);
        node.id = self.id.node_id();
        node.created_at = self.created_at;
        node.updated_at = self.created_at;
        node
    }

    pub(crate) fn from_node(node: &Node) -> Result<Self> {
        expect_type(node, NodeType::Experience)?;
        let session_id = node.require_str("session_id")?;
        Ok(Self {
            id: node.id.clone().into(),
            session_id: SessionId::parse(session_id)
                .map_err(|e| Error::Corruption(format!("bad session id '{}': {}", session_id, e)))?,
            experience_type: node
                .require_str("type")?
                .parse()
                .map_err(|e: Error| Error::Corruption(e.to_string()))?,
            content: node.require_str("content")?.to_string(),
            tags: node.attr_as("tags")?.unwrap_or_default(),
            created_at: node.created_at,
            sequence: node.attr_u64("sequence").unwrap_or(0),
        })
    }
}

pub(crate) fn expect_type(node: &Node, node_type: NodeType) -> Result<()> {
    if node.node_type != node_type {
        return Err(Error::Corruption(format!(
            "node {} is a {}, expected {}",
            node.id, node.node_type, node_type
        )));
    }
    Ok(())
}
