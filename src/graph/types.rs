//! Core types for the graph store.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Attribute map stored on nodes and edges.
pub type Attributes = HashMap<String, Value>;

/// Current time at the precision the store persists (microseconds).
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Unique identifier for a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Session,
    Experience,
    Knowledge,
    /// Source file in the code-structure graph
    File,
    Class,
    Function,
}

impl NodeType {
    pub const ALL: [NodeType; 7] = [
        Self::Agent,
        Self::Session,
        Self::Experience,
        Self::Knowledge,
        Self::File,
        Self::Class,
        Self::Function,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Session => "session",
            Self::Experience => "experience",
            Self::Knowledge => "knowledge",
            Self::File => "file",
            Self::Class => "class",
            Self::Function => "function",
        }
    }

    /// Whether this node belongs to the code-structure graph.
    pub fn is_code(&self) -> bool {
        matches!(self, Self::File | Self::Class | Self::Function)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Corruption(format!("unknown node type '{}'", s)))
    }
}

/// Type of a directed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Agent -> Session
    ConductedSession,
    /// Session -> Experience
    Recorded,
    /// Experience -> Knowledge
    ExtractedKnowledge,
    /// Session -> Knowledge
    AppliedKnowledge,
    /// Knowledge (new) -> Knowledge (old)
    Supersedes,
    /// File -> Class/Function, Class -> Function
    Contains,
    /// File -> File
    Imports,
    /// Function -> Function
    Calls,
}

impl EdgeType {
    pub const ALL: [EdgeType; 8] = [
        Self::ConductedSession,
        Self::Recorded,
        Self::ExtractedKnowledge,
        Self::AppliedKnowledge,
        Self::Supersedes,
        Self::Contains,
        Self::Imports,
        Self::Calls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConductedSession => "conducted_session",
            Self::Recorded => "recorded",
            Self::ExtractedKnowledge => "extracted_knowledge",
            Self::AppliedKnowledge => "applied_knowledge",
            Self::Supersedes => "supersedes",
            Self::Contains => "contains",
            Self::Imports => "imports",
            Self::Calls => "calls",
        }
    }

    /// Edge types whose relation must stay a DAG.
    pub fn is_acyclic(&self) -> bool {
        matches!(self, Self::Supersedes | Self::Contains)
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EdgeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Corruption(format!("unknown edge type '{}'", s)))
    }
}

/// A node in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node with the current timestamp.
    pub fn new(node_type: NodeType) -> Self {
        let now = timestamp_now();
        Self {
            id: NodeId::new(),
            node_type,
            attributes: Attributes::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(Value::as_f64)
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attributes.get(key).and_then(Value::as_u64)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(Value::as_bool)
    }

    /// Deserialize an attribute into a typed value.
    pub fn attr_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.attributes.get(key) {
            Some(Value::Null) | None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }

    /// Fetch a required string attribute, reporting a corrupt record if missing.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.attr_str(key).ok_or_else(|| {
            Error::Corruption(format!(
                "{} node {} is missing attribute '{}'",
                self.node_type, self.id, key
            ))
        })
    }
}

/// A directed, typed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub edge_type: EdgeType,
    pub from: NodeId,
    pub to: NodeId,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(edge_type: EdgeType, from: NodeId, to: NodeId) -> Self {
        Self {
            id: EdgeId::new(),
            edge_type,
            from,
            to,
            attributes: Attributes::new(),
            created_at: timestamp_now(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Ordering for node listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeOrder {
    #[default]
    CreatedAsc,
    CreatedDesc,
    /// Ascending by a numeric attribute
    AttrAsc(&'static str),
}

/// Filter for listing nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub node_type: Option<NodeType>,
    /// Attribute equality constraints
    pub attrs: Vec<(String, Value)>,
    /// Only nodes that are not the target of an edge of this type
    pub without_incoming: Option<EdgeType>,
    /// Only nodes whose numeric attribute is strictly greater than the value
    pub attr_greater_than: Option<(String, i64)>,
    pub order: NodeOrder,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl NodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(node_type: NodeType) -> Self {
        Self {
            node_type: Some(node_type),
            ..Self::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn without_incoming(mut self, edge_type: EdgeType) -> Self {
        self.without_incoming = Some(edge_type);
        self
    }

    pub fn attr_greater_than(mut self, key: impl Into<String>, value: i64) -> Self {
        self.attr_greater_than = Some((key.into(), value));
        self
    }

    pub fn order(mut self, order: NodeOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Direction to follow edges during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

/// Where a traversal starts.
#[derive(Debug, Clone)]
pub enum NodeSelector {
    Id(NodeId),
    /// First node of the type whose attribute equals the value
    Attr {
        node_type: NodeType,
        key: String,
        value: Value,
    },
}

/// Traversal pattern for [`GraphView::query`](super::GraphView::query).
#[derive(Debug, Clone)]
pub struct Pattern {
    pub start: NodeSelector,
    /// Edge types to follow (None follows all)
    pub edge_types: Option<Vec<EdgeType>>,
    pub direction: Direction,
    /// Node types reported as matches (None reports all reached nodes)
    pub target_types: Option<Vec<NodeType>>,
}

impl Pattern {
    pub fn from(start: NodeSelector) -> Self {
        Self {
            start,
            edge_types: None,
            direction: Direction::Outgoing,
            target_types: None,
        }
    }

    pub fn follow(mut self, edge_types: Vec<EdgeType>) -> Self {
        self.edge_types = Some(edge_types);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn targets(mut self, node_types: Vec<NodeType>) -> Self {
        self.target_types = Some(node_types);
        self
    }
}

/// A node reached by a traversal.
#[derive(Debug, Clone)]
pub struct Match {
    pub node: Node,
    pub depth: u32,
    /// Edge that led to this node (None for the start node)
    pub via: Option<Edge>,
}

/// Cooperative deadline threaded through long reads.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn none() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.limit
            .map(|limit| self.started.elapsed() >= limit)
            .unwrap_or(false)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(Error::timeout(self.started.elapsed().as_millis() as u64))
        } else {
            Ok(())
        }
    }
}

/// Resource limits for a read.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_depth: u32,
    pub cost_budget: u64,
    pub deadline: Deadline,
}

impl QueryLimits {
    pub fn new(max_depth: u32, cost_budget: u64) -> Self {
        Self {
            max_depth,
            cost_budget,
            deadline: Deadline::none(),
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn meter(&self) -> CostMeter {
        CostMeter::new(self.cost_budget, self.deadline)
    }
}

/// Deadline checks happen once per this many cost units.
const DEADLINE_CHECK_INTERVAL: u64 = 16;

/// Tracks cost spent by a read against its budget.
#[derive(Debug)]
pub struct CostMeter {
    budget: u64,
    spent: u64,
    deadline: Deadline,
}

impl CostMeter {
    pub fn new(budget: u64, deadline: Deadline) -> Self {
        Self {
            budget,
            spent: 0,
            deadline,
        }
    }

    /// Charge units of work; fails once the budget or the deadline is exhausted.
    pub fn charge(&mut self, units: u64) -> Result<()> {
        let before = self.spent;
        self.spent = self.spent.saturating_add(units);
        if self.spent > self.budget {
            return Err(Error::cost_exceeded(self.budget, self.spent));
        }
        if before / DEADLINE_CHECK_INTERVAL != self.spent / DEADLINE_CHECK_INTERVAL {
            self.deadline.check()?;
        }
        Ok(())
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }

    /// Units left before the budget is exceeded.
    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.spent)
    }

    /// Row limit for a scan charged one unit per row. One row past the
    /// remaining budget is loaded so the overrun still surfaces.
    pub fn row_limit(&self) -> usize {
        let rows = self.remaining().saturating_add(1).min(i64::MAX as u64);
        usize::try_from(rows).unwrap_or(usize::MAX)
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}
