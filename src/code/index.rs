//! Ingestion of parsed source files into the code-structure graph.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument};

use crate::code::types::*;
use crate::error::Result;
use crate::graph::{
    timestamp_now, Edge, EdgeType, GraphStore, GraphTx, Node, NodeFilter, NodeId, NodeType,
};

/// Writes files, classes and functions plus their relations into the graph.
pub struct CodeGraph {
    graph: Arc<GraphStore>,
}

impl CodeGraph {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self { graph }
    }

    /// Upsert one file and its symbols in a single transaction.
    ///
    /// Re-indexing a file reuses existing nodes and only adds missing edges.
    /// Imported files that were never indexed get placeholder nodes.
    #[instrument(skip(self, file), fields(path = %file.path))]
    pub fn index_file(&self, file: &CodeFile) -> Result<IndexedFile> {
        file.validate()?;

        let indexed = self.graph.write(|tx| {
            let file_id = upsert_file(tx, &file.path, Some(file))?;

            let mut by_name: HashMap<String, NodeId> = HashMap::new();
            let mut functions: HashMap<&str, NodeId> = HashMap::new();

            for symbol in file.symbols.iter().filter(|s| s.parent.is_none()) {
                let id = upsert_symbol(tx, &file.path, symbol)?;
                ensure_edge(tx, EdgeType::Contains, &file_id, &id)?;
                if symbol.kind == SymbolKind::Function {
                    functions.entry(symbol.name.as_str()).or_insert_with(|| id.clone());
                }
                by_name.insert(symbol.qualified_name(), id);
            }
            for symbol in file.symbols.iter().filter(|s| s.parent.is_some()) {
                let id = upsert_symbol(tx, &file.path, symbol)?;
                let parent = symbol
                    .parent
                    .as_ref()
                    .and_then(|p| by_name.get(p))
                    .cloned()
                    .unwrap_or_else(|| file_id.clone());
                ensure_edge(tx, EdgeType::Contains, &parent, &id)?;
                if symbol.kind == SymbolKind::Function {
                    functions.entry(symbol.name.as_str()).or_insert_with(|| id.clone());
                }
                by_name.insert(symbol.qualified_name(), id);
            }

            for import in &file.imports {
                let target = upsert_file(tx, import, None)?;
                if target != file_id {
                    ensure_edge(tx, EdgeType::Imports, &file_id, &target)?;
                }
            }

            let mut calls = 0;
            let mut unresolved_calls = 0;
            for symbol in &file.symbols {
                let Some(caller) = by_name.get(&symbol.qualified_name()) else {
                    continue;
                };
                for callee in &symbol.calls {
                    let target = match functions.get(callee.as_str()) {
                        Some(id) => Some(id.clone()),
                        None => find_function(tx, callee)?,
                    };
                    match target {
                        Some(target) => {
                            ensure_edge(tx, EdgeType::Calls, caller, &target)?;
                            calls += 1;
                        }
                        None => unresolved_calls += 1,
                    }
                }
            }

            Ok(IndexedFile {
                file_id,
                symbols: by_name.len(),
                imports: file.imports.len(),
                calls,
                unresolved_calls,
            })
        })?;

        debug!(
            symbols = indexed.symbols,
            calls = indexed.calls,
            unresolved = indexed.unresolved_calls,
            "file indexed"
        );
        Ok(indexed)
    }

    /// Look up a file node by path.
    pub fn file(&self, path: &str) -> Result<Option<Node>> {
        self.graph.read(|view| {
            Ok(view
                .find_nodes(&NodeFilter::of_type(NodeType::File).attr("path", path).limit(1))?
                .into_iter()
                .next())
        })
    }
}

fn upsert_file(tx: &GraphTx<'_>, path: &str, file: Option<&CodeFile>) -> Result<NodeId> {
    let existing = tx
        .view()
        .find_nodes(&NodeFilter::of_type(NodeType::File).attr("path", path).limit(1))?
        .into_iter()
        .next();

    let mut attrs = crate::graph::Attributes::new();
    if let Some(file) = file {
        attrs.insert("indexed".into(), json!(true));
        attrs.insert("indexed_at".into(), json!(timestamp_now()));
        attrs.insert("language".into(), json!(file.language));
    }

    match existing {
        Some(node) => {
            if !attrs.is_empty() {
                tx.update_attributes(&node.id, attrs)?;
            }
            Ok(node.id)
        }
        None => {
            let mut node = Node::new(NodeType::File)
                .with_attr("path", path)
                .with_attr("name", file_name(path));
            node.attributes.insert("indexed".into(), json!(false));
            node.attributes.extend(attrs);
            tx.create_node(&node)
        }
    }
}

fn upsert_symbol(tx: &GraphTx<'_>, path: &str, symbol: &CodeSymbol) -> Result<NodeId> {
    let qualified = symbol.qualified_name();
    let existing = tx
        .view()
        .find_nodes(
            &NodeFilter::of_type(symbol.kind.node_type())
                .attr("path", path)
                .attr("qualified_name", qualified.as_str())
                .limit(1),
        )?
        .into_iter()
        .next();
    if let Some(node) = existing {
        return Ok(node.id);
    }

    let node = Node::new(symbol.kind.node_type())
        .with_attr("name", symbol.name.as_str())
        .with_attr("qualified_name", qualified)
        .with_attr("path", path);
    tx.create_node(&node)
}

fn find_function(tx: &GraphTx<'_>, name: &str) -> Result<Option<NodeId>> {
    Ok(tx
        .view()
        .find_nodes(
            &NodeFilter::of_type(NodeType::Function)
                .attr("name", name)
                .limit(1),
        )?
        .into_iter()
        .next()
        .map(|node| node.id))
}

fn ensure_edge(tx: &GraphTx<'_>, edge_type: EdgeType, from: &NodeId, to: &NodeId) -> Result<()> {
    let exists = tx
        .view()
        .edges_from(from, Some(edge_type))?
        .iter()
        .any(|edge| &edge.to == to);
    if !exists {
        tx.create_edge(&Edge::new(edge_type, from.clone(), to.clone()))?;
    }
    Ok(())
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_file() -> CodeFile {
        CodeFile::new("src/auth.rs")
            .language("rust")
            .import("src/db.rs")
            .symbol(CodeSymbol::class("Session"))
            .symbol(CodeSymbol::function("login").calling("hash").calling("connect"))
            .symbol(CodeSymbol::function("hash"))
            .symbol(CodeSymbol::function("refresh").in_class("Session").calling("login"))
    }

    #[test]
    fn test_index_creates_structure() {
        let graph = Arc::new(GraphStore::in_memory().unwrap());
        let code = CodeGraph::new(Arc::clone(&graph));

        let indexed = code.index_file(&auth_file()).unwrap();
        assert_eq!(indexed.symbols, 4);
        assert_eq!(indexed.calls, 2);
        assert_eq!(indexed.unresolved_calls, 1);

        let stats = graph.stats().unwrap();
        assert_eq!(stats.nodes(NodeType::File), 2);
        assert_eq!(stats.nodes(NodeType::Class), 1);
        assert_eq!(stats.nodes(NodeType::Function), 3);
        assert_eq!(stats.edges(EdgeType::Contains), 4);
        assert_eq!(stats.edges(EdgeType::Imports), 1);

        let placeholder = code.file("src/db.rs").unwrap().unwrap();
        assert_eq!(placeholder.attr_bool("indexed"), Some(false));
        assert_eq!(placeholder.attr_str("name"), Some("db.rs"));
    }

    #[test]
    fn test_reindex_is_stable_and_resolves_later_calls() {
        let graph = Arc::new(GraphStore::in_memory().unwrap());
        let code = CodeGraph::new(Arc::clone(&graph));
        code.index_file(&auth_file()).unwrap();

        let db = CodeFile::new("src/db.rs").symbol(CodeSymbol::function("connect"));
        code.index_file(&db).unwrap();
        let again = code.index_file(&auth_file()).unwrap();
        assert_eq!(again.unresolved_calls, 0);

        let stats = graph.stats().unwrap();
        assert_eq!(stats.nodes(NodeType::File), 2);
        assert_eq!(stats.nodes(NodeType::Function), 4);
        assert_eq!(stats.edges(EdgeType::Calls), 3);
        assert_eq!(
            code.file("src/db.rs").unwrap().unwrap().attr_bool("indexed"),
            Some(true)
        );
    }
}
