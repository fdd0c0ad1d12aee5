//! Code-structure graph: files, classes and functions.
//!
//! Parsing is done elsewhere; this module only ingests the resulting
//! [`CodeFile`] summaries and exposes them to retrieval.

mod index;
mod types;

pub use index::CodeGraph;
pub use types::{CodeContext, CodeEntity, CodeFile, CodeSymbol, IndexedFile, SymbolKind};
