//! Change events flowing from source watchers into the ingestion pipeline.
//!
//! Watchers never build [`Document`](live_context_core::models::Document)s
//! themselves. They emit [`ChangeEvent`]s naming a path and where its new
//! content can be found, and the Loader turns those into versioned documents.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use live_context_core::models::{DocumentId, SourceType};
use uuid::Uuid;

/// Source id of the local directory watcher.
pub const LOCAL_SOURCE_ID: &str = "local";

/// Source id of the remote repository webhook stream.
pub const REMOTE_SOURCE_ID: &str = "remote";

/// Where the Loader finds the new content of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRef {
    /// Content carried in the event itself.
    Inline(String),
    /// Content read from disk when the event is loaded.
    File(PathBuf),
    /// Content fetched over HTTP when the event is loaded.
    Url(String),
}

/// What happened to a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert(ContentRef),
    Delete,
}

/// A raw change observed by a watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub source_id: String,
    pub source_type: SourceType,
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    pub change: Change,
    /// Free-form provenance for logs (e.g. a commit SHA).
    pub origin: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(source_type: SourceType, path: impl Into<String>, change: Change) -> Self {
        let source_id = match source_type {
            SourceType::Local => LOCAL_SOURCE_ID,
            SourceType::Remote => REMOTE_SOURCE_ID,
        };
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            source_type,
            path: path.into(),
            change,
            origin: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn document_id(&self) -> DocumentId {
        DocumentId::new(self.source_id.clone(), self.path.clone())
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.change, Change::Delete)
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.change {
            Change::Upsert(_) => "upsert",
            Change::Delete => "delete",
        };
        write!(f, "{} {}:{}", kind, self.source_id, self.path)
    }
}
