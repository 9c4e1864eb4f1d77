//! Error taxonomy shared by ingestion and retrieval.
//!
//! Ingestion errors (`TransientIo`, `MalformedInput`, `EmbeddingUnavailable`,
//! `IndexCorruption`) are handled per event and never cross into the query
//! path. A query can only fail with `Timeout` or `EmbedderUnavailable`.

use std::time::Duration;

/// Errors produced by the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Retryable I/O failure: file read races, network blips.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// A single event or payload that can never succeed (bad webhook
    /// payload, binary or oversized content, invalid encoding).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The embedding backend failed in a way that may recover.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// An index invariant was found violated for one document.
    #[error("index corruption detected for {document}")]
    IndexCorruption { document: String },

    /// A query exceeded its caller-supplied deadline.
    #[error("query timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The query text could not be embedded.
    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),
}

impl EngineError {
    /// Whether a bounded retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientIo(_) | EngineError::EmbeddingUnavailable(_)
        )
    }
}

/// Result alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
