//! SQLite-backed graph store implementation.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::graph::schema::{initialize_schema, is_initialized, verify_integrity};
use crate::graph::types::*;

const NODE_COLUMNS: &str = "n.id, n.node_type, n.attributes, n.created_at, n.updated_at";
const EDGE_COLUMNS: &str = "e.id, e.edge_type, e.from_id, e.to_id, e.attributes, e.created_at";

/// Transactional graph store over SQLite.
///
/// Writes are serialized through a single connection and always run inside a
/// `BEGIN IMMEDIATE` transaction. File-backed stores serve reads from a pool of
/// read-only connections so readers see a committed snapshot and never wait
/// on the writer.
pub struct GraphStore {
    writer: Mutex<Connection>,
    readers: Option<ReaderPool>,
}

struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    busy_timeout: Duration,
}

impl ReaderPool {
    fn acquire(&self) -> Result<Connection> {
        let pooled = self
            .idle
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock reader pool: {}", e)))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                let conn = Connection::open_with_flags(
                    &self.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(self.busy_timeout)?;
                Ok(conn)
            }
        }
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
    }
}

/// Options for opening a file-backed store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub reader_pool_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            reader_pool_size: 4,
        }
    }
}

impl GraphStore {
    /// Open or create a store at the given path.
    ///
    /// An existing database that fails the integrity check is rejected with
    /// [`Error::Corruption`].
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(options.busy_timeout)?;

        verify_integrity(&conn)?;
        if !is_initialized(&conn)? {
            initialize_schema(&conn)?;
        } else {
            conn.pragma_update(None, "foreign_keys", "ON")?;
        }
        debug!("graph store opened");

        Ok(Self {
            writer: Mutex::new(conn),
            readers: Some(ReaderPool {
                path,
                idle: Mutex::new(Vec::new()),
                max_idle: options.reader_pool_size,
                busy_timeout: options.busy_timeout,
            }),
        })
    }

    /// Create an in-memory store (for testing). Reads share the writer connection.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;

        Ok(Self {
            writer: Mutex::new(conn),
            readers: None,
        })
    }

    fn with_writer<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&mut conn)
    }

    /// Run `f` inside a write transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&GraphTx<'_>) -> Result<T>,
    {
        self.with_writer(|conn| {
            let tx = GraphTx {
                tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
            };
            let value = f(&tx)?;
            tx.tx.commit()?;
            Ok(value)
        })
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&GraphView<'_>) -> Result<T>,
    {
        match &self.readers {
            Some(pool) => {
                let mut conn = pool.acquire()?;
                let result = read_snapshot(&mut conn, f);
                pool.release(conn);
                result
            }
            None => self.with_writer(|conn| read_snapshot(conn, f)),
        }
    }

    // ==================== Convenience Operations ====================

    /// Create a node with the given attributes in its own transaction.
    pub fn create_node(&self, node_type: NodeType, attributes: Attributes) -> Result<NodeId> {
        self.write(|tx| tx.insert_node(node_type, attributes))
    }

    /// Create an edge in its own transaction.
    pub fn create_edge(
        &self,
        edge_type: EdgeType,
        from: &NodeId,
        to: &NodeId,
        attributes: Attributes,
    ) -> Result<EdgeId> {
        self.write(|tx| {
            let mut edge = Edge::new(edge_type, from.clone(), to.clone());
            edge.attributes = attributes;
            tx.create_edge(&edge)
        })
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        self.read(|view| view.get_node(id))
    }

    /// Run a bounded traversal. Partial results are discarded on failure.
    pub fn query(&self, pattern: &Pattern, limits: &QueryLimits) -> Result<Vec<Match>> {
        self.read(|view| view.query(pattern, limits))
    }

    /// Node and edge counts per type.
    pub fn stats(&self) -> Result<GraphStats> {
        self.read(|view| view.stats())
    }
}

fn read_snapshot<F, T>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&GraphView<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let result = f(&GraphView { conn: &tx });
    tx.rollback()?;
    result
}

/// Counts per node and edge type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphStats {
    pub nodes_by_type: BTreeMap<NodeType, u64>,
    pub edges_by_type: BTreeMap<EdgeType, u64>,
}

impl GraphStats {
    pub fn nodes(&self, node_type: NodeType) -> u64 {
        self.nodes_by_type.get(&node_type).copied().unwrap_or(0)
    }

    pub fn edges(&self, edge_type: EdgeType) -> u64 {
        self.edges_by_type.get(&edge_type).copied().unwrap_or(0)
    }
}

// ==================== Read View ====================

/// Read access to the graph inside a transaction.
pub struct GraphView<'c> {
    conn: &'c Connection,
}

impl<'c> GraphView<'c> {
    /// Get a node by ID.
    pub fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM nodes n WHERE n.id = ?1", NODE_COLUMNS),
                params![id.to_string()],
                RawNode::from_row,
            )
            .optional()?;
        raw.map(RawNode::into_node).transpose()
    }

    /// Get a node by ID, failing with `NotFound` if missing or of another type.
    pub fn require_node(&self, id: &NodeId, node_type: NodeType) -> Result<Node> {
        match self.get_node(id)? {
            Some(node) if node.node_type == node_type => Ok(node),
            _ => Err(Error::not_found(node_type.as_str(), id)),
        }
    }

    /// Get an edge by ID.
    pub fn get_edge(&self, id: &EdgeId) -> Result<Option<Edge>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM edges e WHERE e.id = ?1", EDGE_COLUMNS),
                params![id.to_string()],
                RawEdge::from_row,
            )
            .optional()?;
        raw.map(RawEdge::into_edge).transpose()
    }

    /// List nodes matching a filter.
    pub fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let (where_sql, mut bindings) = filter_clause(filter)?;
        let mut sql = format!("SELECT {} FROM nodes n WHERE {}", NODE_COLUMNS, where_sql);

        match filter.order {
            NodeOrder::CreatedAsc => sql.push_str(" ORDER BY n.created_at ASC, n.rowid ASC"),
            NodeOrder::CreatedDesc => sql.push_str(" ORDER BY n.created_at DESC, n.rowid DESC"),
            NodeOrder::AttrAsc(key) => sql.push_str(&format!(
                " ORDER BY CAST({} AS REAL) ASC, n.rowid ASC",
                attr_expr(key)?
            )),
        }

        if filter.limit.is_some() || filter.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
            bindings.push(SqlValue::Integer(filter.limit.map(|l| l as i64).unwrap_or(-1)));
            bindings.push(SqlValue::Integer(filter.offset.unwrap_or(0) as i64));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(rusqlite::params_from_iter(bindings), RawNode::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawNode::into_node).collect()
    }

    /// Count nodes matching a filter (ordering and paging are ignored).
    pub fn count_nodes(&self, filter: &NodeFilter) -> Result<u64> {
        let (where_sql, bindings) = filter_clause(filter)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM nodes n WHERE {}", where_sql),
            rusqlite::params_from_iter(bindings),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Edges leaving a node, oldest first.
    pub fn edges_from(&self, id: &NodeId, edge_type: Option<EdgeType>) -> Result<Vec<Edge>> {
        self.edges_where("e.from_id", id, edge_type.as_ref().map(std::slice::from_ref))
    }

    /// Edges entering a node, oldest first.
    pub fn edges_to(&self, id: &NodeId, edge_type: Option<EdgeType>) -> Result<Vec<Edge>> {
        self.edges_where("e.to_id", id, edge_type.as_ref().map(std::slice::from_ref))
    }

    fn edges_where(
        &self,
        column: &str,
        id: &NodeId,
        edge_types: Option<&[EdgeType]>,
    ) -> Result<Vec<Edge>> {
        let mut sql = format!("SELECT {} FROM edges e WHERE {} = ?", EDGE_COLUMNS, column);
        let mut bindings = vec![SqlValue::Text(id.to_string())];
        if let Some(types) = edge_types {
            let placeholders: Vec<&str> = types.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND e.edge_type IN ({})", placeholders.join(",")));
            bindings.extend(types.iter().map(|t| SqlValue::Text(t.to_string())));
        }
        sql.push_str(" ORDER BY e.created_at ASC, e.rowid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(rusqlite::params_from_iter(bindings), RawEdge::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawEdge::into_edge).collect()
    }

    /// Whether `target` is reachable from `start` following edges of one type.
    pub fn reachable(&self, start: &NodeId, target: &NodeId, edge_type: EdgeType) -> Result<bool> {
        let found: bool = self.conn.query_row(
            "WITH RECURSIVE reach(id) AS (
                SELECT ?1
                UNION
                SELECT e.to_id FROM edges e JOIN reach r ON e.from_id = r.id
                WHERE e.edge_type = ?3
            )
            SELECT EXISTS(SELECT 1 FROM reach WHERE id = ?2)",
            params![start.to_string(), target.to_string(), edge_type.to_string()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Breadth-first traversal bounded by depth, cost and deadline.
    ///
    /// Each node loaded and each edge examined costs one unit.
    pub fn query(&self, pattern: &Pattern, limits: &QueryLimits) -> Result<Vec<Match>> {
        let mut meter = limits.meter();
        let start = self.resolve(&pattern.start, &mut meter)?;

        let wanted = |node: &Node| {
            pattern
                .target_types
                .as_ref()
                .map(|types| types.contains(&node.node_type))
                .unwrap_or(true)
        };

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<(NodeId, u32)> = VecDeque::new();
        let mut matches = Vec::new();

        visited.insert(start.id.clone());
        queue.push_back((start.id.clone(), 0));
        if wanted(&start) {
            matches.push(Match {
                node: start,
                depth: 0,
                via: None,
            });
        }

        while let Some((id, depth)) = queue.pop_front() {
            if depth >= limits.max_depth {
                continue;
            }

            let types = pattern.edge_types.as_deref();
            let mut edges = Vec::new();
            if matches!(pattern.direction, Direction::Outgoing | Direction::Both) {
                edges.extend(self.edges_where("e.from_id", &id, types)?);
            }
            if matches!(pattern.direction, Direction::Incoming | Direction::Both) {
                edges.extend(self.edges_where("e.to_id", &id, types)?);
            }

            for edge in edges {
                meter.charge(1)?;
                let next = if edge.from == id {
                    edge.to.clone()
                } else {
                    edge.from.clone()
                };
                if !visited.insert(next.clone()) {
                    continue;
                }

                meter.charge(1)?;
                let node = self
                    .get_node(&next)?
                    .ok_or_else(|| Error::Corruption(format!("edge {} points at missing node", edge.id)))?;
                if wanted(&node) {
                    matches.push(Match {
                        node,
                        depth: depth + 1,
                        via: Some(edge),
                    });
                }
                queue.push_back((next, depth + 1));
            }
        }

        debug!(spent = meter.spent(), matches = matches.len(), "query complete");
        Ok(matches)
    }

    fn resolve(&self, selector: &NodeSelector, meter: &mut CostMeter) -> Result<Node> {
        meter.charge(1)?;
        match selector {
            NodeSelector::Id(id) => self
                .get_node(id)?
                .ok_or_else(|| Error::not_found("node", id)),
            NodeSelector::Attr {
                node_type,
                key,
                value,
            } => self
                .find_nodes(
                    &NodeFilter::of_type(*node_type)
                        .attr(key.clone(), value.clone())
                        .limit(1),
                )?
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found(node_type.as_str(), value_label(value))),
        }
    }

    /// Node and edge counts per type.
    pub fn stats(&self) -> Result<GraphStats> {
        let mut stats = GraphStats::default();

        let mut stmt = self
            .conn
            .prepare("SELECT node_type, COUNT(*) FROM nodes GROUP BY node_type")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (t, count) in rows {
            stats.nodes_by_type.insert(t.parse()?, count as u64);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT edge_type, COUNT(*) FROM edges GROUP BY edge_type")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (t, count) in rows {
            stats.edges_by_type.insert(t.parse()?, count as u64);
        }

        Ok(stats)
    }
}

// ==================== Write Transaction ====================

/// Write access to the graph. Dropped without commit, it rolls back.
pub struct GraphTx<'c> {
    tx: Transaction<'c>,
}

impl<'c> GraphTx<'c> {
    /// Read access inside this transaction (sees its own uncommitted writes).
    pub fn view(&self) -> GraphView<'_> {
        GraphView { conn: &self.tx }
    }

    /// Create a node of the given type.
    pub fn insert_node(&self, node_type: NodeType, attributes: Attributes) -> Result<NodeId> {
        let mut node = Node::new(node_type);
        node.attributes = attributes;
        self.create_node(&node)
    }

    /// Insert a fully-formed node.
    pub fn create_node(&self, node: &Node) -> Result<NodeId> {
        self.tx.execute(
            "INSERT INTO nodes (id, node_type, attributes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                node.id.to_string(),
                node.node_type.to_string(),
                serde_json::to_string(&node.attributes)?,
                format_timestamp(&node.created_at),
                format_timestamp(&node.updated_at),
            ],
        )?;
        Ok(node.id.clone())
    }

    /// Insert an edge.
    ///
    /// Both endpoints must exist. For acyclic edge types the edge is rejected
    /// if it would close a cycle.
    pub fn create_edge(&self, edge: &Edge) -> Result<EdgeId> {
        let view = self.view();
        if view.get_node(&edge.from)?.is_none() {
            return Err(Error::not_found("node", &edge.from));
        }
        if view.get_node(&edge.to)?.is_none() {
            return Err(Error::not_found("node", &edge.to));
        }

        if edge.edge_type.is_acyclic()
            && (edge.from == edge.to || view.reachable(&edge.to, &edge.from, edge.edge_type)?)
        {
            return Err(Error::validation(format!(
                "{} edge {} -> {} would create a cycle",
                edge.edge_type, edge.from, edge.to
            )));
        }

        self.tx.execute(
            "INSERT INTO edges (id, edge_type, from_id, to_id, attributes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.id.to_string(),
                edge.edge_type.to_string(),
                edge.from.to_string(),
                edge.to.to_string(),
                serde_json::to_string(&edge.attributes)?,
                format_timestamp(&edge.created_at),
            ],
        )?;
        Ok(edge.id.clone())
    }

    /// Merge `patch` into a node's attributes and bump `updated_at`.
    pub fn update_attributes(&self, id: &NodeId, patch: Attributes) -> Result<Node> {
        let mut node = self
            .view()
            .get_node(id)?
            .ok_or_else(|| Error::not_found("node", id))?;
        node.attributes.extend(patch);
        node.updated_at = timestamp_now();

        self.tx.execute(
            "UPDATE nodes SET attributes = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(&node.attributes)?,
                format_timestamp(&node.updated_at),
            ],
        )?;
        Ok(node)
    }
}

// ==================== Row Mapping ====================

struct RawNode {
    id: String,
    node_type: String,
    attributes: String,
    created_at: String,
    updated_at: String,
}

impl RawNode {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            node_type: row.get(1)?,
            attributes: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_node(self) -> Result<Node> {
        Ok(Node {
            id: NodeId::parse(&self.id)
                .map_err(|e| Error::Corruption(format!("bad node id '{}': {}", self.id, e)))?,
            node_type: self.node_type.parse()?,
            attributes: serde_json::from_str(&self.attributes)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct RawEdge {
    id: String,
    edge_type: String,
    from: String,
    to: String,
    attributes: String,
    created_at: String,
}

impl RawEdge {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            edge_type: row.get(1)?,
            from: row.get(2)?,
            to: row.get(3)?,
            attributes: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_edge(self) -> Result<Edge> {
        let parse_node = |s: &str| {
            NodeId::parse(s).map_err(|e| Error::Corruption(format!("bad node id '{}': {}", s, e)))
        };
        Ok(Edge {
            id: EdgeId::parse(&self.id)
                .map_err(|e| Error::Corruption(format!("bad edge id '{}': {}", self.id, e)))?,
            edge_type: self.edge_type.parse()?,
            from: parse_node(&self.from)?,
            to: parse_node(&self.to)?,
            attributes: serde_json::from_str(&self.attributes)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn filter_clause(filter: &NodeFilter) -> Result<(String, Vec<SqlValue>)> {
    let mut clauses = vec!["1=1".to_string()];
    let mut bindings = Vec::new();

    if let Some(node_type) = filter.node_type {
        clauses.push("n.node_type = ?".to_string());
        bindings.push(SqlValue::Text(node_type.to_string()));
    }

    for (key, value) in &filter.attrs {
        let expr = attr_expr(key)?;
        match json_to_sql(value) {
            Some(v) => {
                clauses.push(format!("{} = ?", expr));
                bindings.push(v);
            }
            None => clauses.push(format!("{} IS NULL", expr)),
        }
    }

    if let Some(edge_type) = filter.without_incoming {
        clauses.push(
            "NOT EXISTS (SELECT 1 FROM edges e WHERE e.to_id = n.id AND e.edge_type = ?)"
                .to_string(),
        );
        bindings.push(SqlValue::Text(edge_type.to_string()));
    }

    if let Some((key, value)) = &filter.attr_greater_than {
        clauses.push(format!("CAST({} AS INTEGER) > ?", attr_expr(key)?));
        bindings.push(SqlValue::Integer(*value));
    }

    Ok((clauses.join(" AND "), bindings))
}

/// JSON path expression for an attribute. Keys are restricted to identifiers
/// so the path can be inlined and match the expression indexes.
fn attr_expr(key: &str) -> Result<String> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::validation(format!("invalid attribute key '{}'", key)));
    }
    Ok(format!("json_extract(n.attributes, '$.{}')", key))
}

fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(*b as i64)),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

fn value_label(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Timestamps are stored with fixed precision so text order is time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Corruption(format!("bad timestamp '{}': {}", s, e)))
}
