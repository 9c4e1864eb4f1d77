//! Core data models used throughout Live Context.
//!
//! These types represent the documents, chunks, vectors, index entries and
//! retrieval results that flow through the ingestion and query pipelines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic per-path version number. The first version of a path is `1`.
pub type Version = u64;

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A watched directory on the local filesystem.
    Local,
    /// A remote repository feeding webhook events.
    Remote,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Local => "local",
            SourceType::Remote => "remote",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document identity: `(source_id, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DocumentId {
    pub source_id: String,
    pub path: String,
}

impl DocumentId {
    pub fn new(source_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.path)
    }
}

/// A normalized source file at one version.
///
/// Documents are never mutated: a newer version of the same path produces a
/// new `Document` that supersedes this one.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub source_id: String,
    pub path: String,
    pub content: String,
    /// SHA-256 hex digest of `content`.
    pub content_hash: String,
    pub version: Version,
    pub source_type: SourceType,
}

impl Document {
    pub fn id(&self) -> DocumentId {
        DocumentId::new(self.source_id.clone(), self.path.clone())
    }
}

/// Inclusive, 1-based line range within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

/// A bounded-size segment of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub document_id: DocumentId,
    /// Ordinal position within the document, contiguous from 0.
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
    pub version: Version,
    pub lines: LineRange,
}

impl Chunk {
    /// Stable identifier for this chunk at this version.
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.document_id, self.version, self.chunk_index)
    }
}

/// Format a chunk identifier as `source:path@version#index`.
pub fn chunk_id(document: &DocumentId, version: Version, chunk_index: u32) -> String {
    format!("{}@{}#{}", document, version, chunk_index)
}

/// The embedding of one chunk's text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_tag: String,
}

/// Metadata stored alongside each vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMetadata {
    pub source_id: String,
    pub path: String,
    pub source_type: SourceType,
    pub chunk_index: u32,
    pub lines: LineRange,
    pub version: Version,
    pub token_count: usize,
    pub text: String,
}

/// The unit stored in the incremental index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

/// One version assignment for a path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionRecord {
    pub source_id: String,
    pub path: String,
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    /// Hash of the content this version carries; `None` for deletions.
    pub content_hash: Option<String>,
}

/// A ranked hit produced per query. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: EntryMetadata,
}
