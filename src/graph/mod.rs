//! Transactional graph primitive.
//!
//! Nodes and edges live in flat tables keyed by opaque identifiers; callers
//! never hold references into the store. All writes go through
//! [`GraphStore::write`], which runs inside a single SQLite transaction, and
//! all traversals are bounded by depth, a cost budget and a cooperative
//! [`Deadline`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_memory::graph::{Attributes, EdgeType, GraphStore, NodeSelector, NodeType, Pattern, QueryLimits};
//!
//! let store = GraphStore::in_memory()?;
//! let a = store.create_node(NodeType::File, Attributes::new())?;
//! let b = store.create_node(NodeType::File, Attributes::new())?;
//! store.create_edge(EdgeType::Imports, &a, &b, Attributes::new())?;
//!
//! let pattern = Pattern::from(NodeSelector::Id(a)).follow(vec![EdgeType::Imports]);
//! let matches = store.query(&pattern, &QueryLimits::new(3, 100))?;
//! ```

mod schema;
mod store;
mod types;

pub use schema::{get_schema_version, initialize_schema, verify_integrity, SCHEMA_VERSION};
pub use store::{GraphStats, GraphStore, GraphTx, GraphView, StoreOptions};
pub(crate) use store::parse_timestamp;
pub use types::{
    Attributes, CostMeter, Deadline, Direction, Edge, EdgeId, EdgeType, Match, Node, NodeFilter,
    NodeId, NodeOrder, NodeSelector, NodeType, Pattern, QueryLimits, timestamp_now,
};
