//! Code-structure records.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{EdgeType, NodeId, NodeType};

/// Kind of symbol declared in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
}

impl SymbolKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Class => NodeType::Class,
            Self::Function => NodeType::Function,
        }
    }
}

/// A class or function declared in a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSymbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Enclosing class, for methods
    #[serde(default)]
    pub parent: Option<String>,
    /// Names of functions this symbol calls
    #[serde(default)]
    pub calls: Vec<String>,
}

impl CodeSymbol {
    pub fn class(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Class,
            parent: None,
            calls: Vec::new(),
        }
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Function,
            parent: None,
            calls: Vec::new(),
        }
    }

    pub fn in_class(mut self, class: impl Into<String>) -> Self {
        self.parent = Some(class.into());
        self
    }

    pub fn calling(mut self, callee: impl Into<String>) -> Self {
        self.calls.push(callee.into());
        self
    }

    /// Name unique within a file (`Class::method` for methods).
    pub fn qualified_name(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}::{}", parent, self.name),
            None => self.name.clone(),
        }
    }
}

/// Structural summary of one source file, produced by an external parser.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodeFile {
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Paths of imported files
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<CodeSymbol>,
}

impl CodeFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn import(mut self, path: impl Into<String>) -> Self {
        self.imports.push(path.into());
        self
    }

    pub fn symbol(mut self, symbol: CodeSymbol) -> Self {
        self.symbols.push(symbol);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::validation("code file path must not be empty"));
        }
        if self.imports.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::validation(format!(
                "{}: import paths must not be empty",
                self.path
            )));
        }
        for symbol in &self.symbols {
            if symbol.name.trim().is_empty() {
                return Err(Error::validation(format!(
                    "{}: symbol names must not be empty",
                    self.path
                )));
            }
            if let Some(parent) = &symbol.parent {
                let declared = self
                    .symbols
                    .iter()
                    .any(|s| s.kind == SymbolKind::Class && s.parent.is_none() && &s.name == parent);
                if !declared {
                    return Err(Error::validation(format!(
                        "{}: '{}' is nested in undeclared class '{}'",
                        self.path, symbol.name, parent
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Counts from one indexing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub file_id: NodeId,
    pub symbols: usize,
    pub imports: usize,
    pub calls: usize,
    /// Calls whose callee is not a known function
    pub unresolved_calls: usize,
}

/// A code entity reached from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeEntity {
    pub node_id: NodeId,
    pub kind: NodeType,
    pub name: String,
    pub path: String,
    pub depth: u32,
    /// Edge type that led here (None for the root file)
    pub relation: Option<EdgeType>,
}

/// Structural neighbourhood of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeContext {
    pub root: CodeEntity,
    pub entities: Vec<CodeEntity>,
}

impl CodeContext {
    pub fn of_kind(&self, kind: NodeType) -> impl Iterator<Item = &CodeEntity> {
        self.entities.iter().filter(move |e| e.kind == kind)
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.entities.iter().map(|e| e.path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_methods_need_declared_class() {
        let file = CodeFile::new("src/auth.rs").symbol(CodeSymbol::function("login").in_class("Auth"));
        assert!(file.validate().is_err());

        let file = CodeFile::new("src/auth.rs")
            .symbol(CodeSymbol::class("Auth"))
            .symbol(CodeSymbol::function("login").in_class("Auth"));
        assert!(file.validate().is_ok());
        assert_eq!(file.symbols[1].qualified_name(), "Auth::login");
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(CodeFile::new(" ").validate().is_err());
    }
}
