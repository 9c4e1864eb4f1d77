//! Ingestion pipeline: Loader → Splitter → Embedder → Index.
//!
//! One [`run_worker`] task drains each source's debounced event queue and
//! processes events strictly in order, so per-path ordering is whatever the
//! watcher emitted. Chunks of one document are embedded concurrently, bounded
//! by `embedding.concurrency`.
//!
//! Errors never leave the worker. A failed event is logged, recorded on the
//! source's [`SourceMonitor`], and the worker moves on to the next event.
//!
//! Unchanged content is skipped only while the index holds a complete entry
//! set for it. A document with degraded chunks is embedded again by the next
//! event carrying the same content, or by [`Ingestor::reindex`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use live_context_core::chunk::split_document;
use live_context_core::embedding::{embed_one, Embedder};
use live_context_core::index::{IncrementalIndex, UpsertOutcome};
use live_context_core::models::{Chunk, Document, DocumentId, EmbeddingVector, SourceType, Version};
use live_context_core::Result;
use tokio::sync::mpsc;

use crate::loader::{Loaded, Loader};
use crate::models::{Change, ChangeEvent, ContentRef};
use crate::stats::SourceMonitor;

/// What processing one event did to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed {
        id: DocumentId,
        version: Version,
        chunks: usize,
        degraded: usize,
    },
    /// Content hash matched the latest version; the index was not touched.
    Unchanged { id: DocumentId, version: Version },
    /// A newer version was assigned or indexed while this one was in flight.
    Superseded { id: DocumentId, version: Version },
    Removed { id: DocumentId, version: Version },
    /// A deleted directory; every document under it was removed.
    RemovedTree { id: DocumentId, documents: usize },
    /// Deletion of a path that was never indexed.
    Ignored { id: DocumentId },
}

/// Where a live document's content came from, kept so the document can be
/// loaded again without a new event.
#[derive(Debug, Clone)]
struct Origin {
    source_type: SourceType,
    content: ContentRef,
}

/// Turns change events into index updates.
pub struct Ingestor {
    loader: Arc<Loader>,
    index: Arc<IncrementalIndex>,
    embedder: Arc<dyn Embedder>,
    max_tokens: usize,
    concurrency: usize,
    max_tombstones: usize,
    origins: Mutex<HashMap<DocumentId, Origin>>,
}

impl Ingestor {
    pub fn new(
        loader: Arc<Loader>,
        index: Arc<IncrementalIndex>,
        embedder: Arc<dyn Embedder>,
        max_tokens: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            loader,
            index,
            embedder,
            max_tokens,
            concurrency: concurrency.max(1),
            max_tombstones: usize::MAX,
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Remember at most `max` deleted paths; older tombstones are dropped
    /// from both the version tracker and the index.
    pub fn with_max_tombstones(mut self, max: usize) -> Self {
        self.max_tombstones = max;
        self
    }

    /// Load, split, embed and index one event.
    pub async fn process(&self, event: &ChangeEvent) -> Result<IngestOutcome> {
        self.ingest(event, false).await
    }

    /// Load the last known content of `id` again and re-upsert it in full,
    /// even when that content is unchanged.
    ///
    /// Returns `None` when `id` has no live content on record.
    pub async fn reindex(&self, id: &DocumentId) -> Result<Option<IngestOutcome>> {
        let Some(origin) = self.origin(id) else {
            return Ok(None);
        };
        let event = ChangeEvent::new(
            origin.source_type,
            id.path.clone(),
            Change::Upsert(origin.content),
        )
        .with_origin("reindex");
        self.ingest(&event, true).await.map(Some)
    }

    async fn ingest(&self, event: &ChangeEvent, force: bool) -> Result<IngestOutcome> {
        let outcome = match self.loader.load(event).await? {
            Loaded::Document(doc) => self.index_document(doc).await?,
            Loaded::Unchanged(doc) => {
                let id = doc.id();
                if force || !self.index.is_complete(&id) {
                    tracing::info!(
                        document = %id,
                        version = doc.version,
                        "re-embedding incomplete document"
                    );
                    self.index_document(doc).await?
                } else {
                    tracing::debug!(
                        document = %id,
                        version = doc.version,
                        "content unchanged, skipping"
                    );
                    IngestOutcome::Unchanged {
                        id,
                        version: doc.version,
                    }
                }
            }
            Loaded::Deleted { id, version } => {
                if self.index.remove(&id, version) {
                    tracing::info!(document = %id, version, "removed document");
                }
                self.remove_tree(&id);
                self.evict_tombstones();
                IngestOutcome::Removed { id, version }
            }
            Loaded::Missing { id } => match self.remove_tree(&id) {
                0 => IngestOutcome::Ignored { id },
                documents => {
                    self.evict_tombstones();
                    IngestOutcome::RemovedTree { id, documents }
                }
            },
        };

        match &outcome {
            IngestOutcome::Indexed { id, .. } | IngestOutcome::Unchanged { id, .. } => {
                if let Change::Upsert(content) = &event.change {
                    self.remember(id, event.source_type, content);
                }
            }
            IngestOutcome::Removed { id, .. } => self.forget(id),
            _ => {}
        }
        Ok(outcome)
    }

    /// Delete every live document below `dir`. A directory that vanished in
    /// one event (moved away, removed recursively) takes its files with it.
    fn remove_tree(&self, dir: &DocumentId) -> usize {
        let mut removed = 0;
        for id in self.index.live_under(&dir.source_id, &dir.path) {
            if let Some(version) = self.loader.tracker().retire(&id) {
                if self.index.remove(&id, version) {
                    removed += 1;
                }
            }
            self.forget(&id);
        }
        if removed > 0 {
            tracing::info!(
                directory = %dir,
                removed,
                "removed documents under deleted directory"
            );
        }
        removed
    }

    fn evict_tombstones(&self) {
        for (id, version) in self.loader.tracker().evict_retired(self.max_tombstones) {
            self.index.purge_tombstone(&id, version);
        }
    }

    fn origin(&self, id: &DocumentId) -> Option<Origin> {
        let origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        origins.get(id).cloned()
    }

    fn remember(&self, id: &DocumentId, source_type: SourceType, content: &ContentRef) {
        let mut origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        origins.insert(
            id.clone(),
            Origin {
                source_type,
                content: content.clone(),
            },
        );
    }

    fn forget(&self, id: &DocumentId) {
        let mut origins = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        origins.remove(id);
    }

    /// Split, embed and upsert a versioned document.
    pub async fn index_document(&self, doc: Document) -> Result<IngestOutcome> {
        let id = doc.id();
        let version = doc.version;

        if !self.loader.tracker().is_current(&id, version) {
            return Ok(IngestOutcome::Superseded { id, version });
        }

        let chunks = split_document(&doc, self.max_tokens);
        let vectors = self.embed_chunks(&chunks).await;
        let degraded = chunks.len() - vectors.len();
        if degraded > 0 {
            tracing::warn!(
                document = %id,
                version,
                degraded,
                "chunks left out of the index after embedding failures"
            );
        }

        match self.index.upsert(&doc, &chunks, &vectors)? {
            UpsertOutcome::Stale { current } => {
                tracing::debug!(document = %id, version, current, "stale upsert dropped");
                Ok(IngestOutcome::Superseded { id, version })
            }
            UpsertOutcome::Inserted { entries } | UpsertOutcome::Replaced { entries, .. } => {
                tracing::info!(document = %id, version, chunks = entries, "indexed document");
                Ok(IngestOutcome::Indexed {
                    id,
                    version,
                    chunks: entries,
                    degraded,
                })
            }
        }
    }

    /// Embed each chunk individually. Chunks whose embedding fails after
    /// retries are left out of the result.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Vec<EmbeddingVector> {
        let model_tag = self.embedder.model_tag().to_string();
        stream::iter(0..chunks.len())
            .map(|i| {
                let chunk = &chunks[i];
                let model_tag = model_tag.clone();
                async move {
                    match embed_one(self.embedder.as_ref(), &chunk.text).await {
                        Ok(vector) => Some(EmbeddingVector {
                            chunk_id: chunk.chunk_id(),
                            vector,
                            model_tag,
                        }),
                        Err(e) => {
                            tracing::warn!(chunk = %chunk.chunk_id(), error = %e, "embedding failed");
                            None
                        }
                    }
                }
            })
            .buffered(self.concurrency)
            .filter_map(|v| async move { v })
            .collect()
            .await
    }
}

/// Process events from `events` until the channel closes.
pub async fn run_worker(
    ingestor: Arc<Ingestor>,
    mut events: mpsc::Receiver<ChangeEvent>,
    monitor: Arc<SourceMonitor>,
) {
    while let Some(event) = events.recv().await {
        match ingestor.process(&event).await {
            Ok(_) => monitor.record_success(),
            Err(e) => {
                tracing::warn!(
                    event = %event,
                    origin = event.origin.as_deref().unwrap_or("-"),
                    error = %e,
                    "dropping event"
                );
                monitor.record_failure(&e);
            }
        }
    }
    tracing::debug!("ingestion worker stopped");
}
