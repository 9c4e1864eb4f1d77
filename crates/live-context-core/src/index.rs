//! Sharded, copy-on-write incremental vector index.
//!
//! Each document owns one immutable entry set (`Arc<EntrySet>`). Writers build
//! the replacement set outside any lock, then swap it into the document's
//! shard under a short write lock, so a concurrent query sees either the old
//! set or the new one and never a mix of the two. Queries clone the `Arc`s of
//! each shard under a read lock and score outside the lock, so they never wait
//! behind the embedding or set construction of any write.
//!
//! # Document lifecycle
//!
//! ```text
//! Absent ──upsert(v1)──▶ Indexed(v1) ──upsert(v2)──▶ Indexed(v2)   (v1 superseded)
//!                              │
//!                              └──remove(v3)──▶ Absent (tombstone v3)
//! ```
//!
//! A write carrying a version older than the stored one (live or tombstone)
//! is rejected as stale, so version N can never overwrite version N+1.
//!
//! # Ranking
//!
//! Results are ordered by cosine similarity (desc), then version (desc), then
//! path (asc). Source id and chunk index break any remaining ties so the
//! order is total and deterministic.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::embedding::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::models::{
    Chunk, Document, DocumentId, EmbeddingVector, EntryMetadata, IndexEntry, RetrievalResult,
    SourceType, Version,
};

/// Default number of lock shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Optional restrictions applied during [`IncrementalIndex::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub source_type: Option<SourceType>,
    pub path_prefix: Option<String>,
}

impl QueryFilter {
    fn matches(&self, meta: &EntryMetadata) -> bool {
        if let Some(st) = self.source_type {
            if meta.source_type != st {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !meta.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Result of an [`IncrementalIndex::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The document was absent (never seen or deleted) and is now indexed.
    Inserted { entries: usize },
    /// A previous version was superseded atomically.
    Replaced { previous: Version, entries: usize },
    /// A newer version is already stored; nothing changed.
    Stale { current: Version },
}

/// Observable state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Absent,
    Indexed { version: Version },
}

/// Index-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    /// Chunks left out of the index because their embedding failed.
    pub degraded_chunks: usize,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct EntrySet {
    version: Version,
    entries: Vec<IndexEntry>,
    degraded: usize,
    tombstone: bool,
}

type Shard = RwLock<HashMap<DocumentId, Arc<EntrySet>>>;

/// The mutable store of chunk vectors, partitioned by document.
#[derive(Debug)]
pub struct IncrementalIndex {
    shards: Box<[Shard]>,
    last_update_ms: AtomicI64,
}

impl IncrementalIndex {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            last_update_ms: AtomicI64::new(0),
        }
    }

    /// Atomically replace every entry of `document` with `chunks`.
    ///
    /// `vectors` are matched to chunks by chunk id. Chunks without a vector
    /// (embedding exhausted its retries) are left out and counted as
    /// degraded until a later version re-embeds them.
    pub fn upsert(
        &self,
        document: &Document,
        chunks: &[Chunk],
        vectors: &[EmbeddingVector],
    ) -> Result<UpsertOutcome> {
        let id = document.id();
        let set = build_entry_set(document, &id, chunks, vectors)?;
        let entries = set.entries.len();

        let mut shard = self
            .shard_for(&id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = shard.get(&id) {
            if current.version > set.version {
                return Ok(UpsertOutcome::Stale {
                    current: current.version,
                });
            }
        }

        let previous = shard
            .insert(id, Arc::new(set))
            .filter(|prev| !prev.tombstone)
            .map(|prev| prev.version);
        drop(shard);
        self.touch();

        Ok(match previous {
            Some(previous) => UpsertOutcome::Replaced { previous, entries },
            None => UpsertOutcome::Inserted { entries },
        })
    }

    /// Atomically remove every entry of `id`, leaving a tombstone at
    /// `version`.
    ///
    /// Returns `false` when a newer version is stored or when there was
    /// nothing live to remove.
    pub fn remove(&self, id: &DocumentId, version: Version) -> bool {
        let mut shard = self
            .shard_for(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = shard.get(id) {
            if current.version > version {
                return false;
            }
        }

        let tombstone = Arc::new(EntrySet {
            version,
            entries: Vec::new(),
            degraded: 0,
            tombstone: true,
        });
        let removed = shard
            .insert(id.clone(), tombstone)
            .is_some_and(|prev| !prev.tombstone);
        drop(shard);

        if removed {
            self.touch();
        }
        removed
    }

    /// Return the `k` entries most similar to `vector`.
    pub fn query(&self, vector: &[f32], k: usize, filter: &QueryFilter) -> Vec<RetrievalResult> {
        if k == 0 {
            return Vec::new();
        }

        let snapshot = self.snapshot();
        let mut hits: Vec<(f32, &IndexEntry)> = snapshot
            .iter()
            .filter(|set| !set.tombstone)
            .flat_map(|set| set.entries.iter())
            .filter(|entry| filter.matches(&entry.metadata))
            .map(|entry| (cosine_similarity(vector, &entry.vector), entry))
            .collect();

        hits.sort_by(|a, b| rank(a.0, &a.1.metadata, b.0, &b.1.metadata));
        hits.truncate(k);

        hits.into_iter()
            .map(|(score, entry)| RetrievalResult {
                chunk_id: entry.chunk_id.clone(),
                score,
                metadata: entry.metadata.clone(),
            })
            .collect()
    }

    /// Live entries of `id`, ordered by chunk index.
    pub fn entries(&self, id: &DocumentId) -> Option<Vec<IndexEntry>> {
        let shard = self
            .shard_for(id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        shard
            .get(id)
            .filter(|set| !set.tombstone)
            .map(|set| set.entries.clone())
    }

    /// Whether `id` is indexed with an embedding for every chunk.
    ///
    /// `false` for absent documents and for documents with degraded chunks,
    /// which both need another embedding pass.
    pub fn is_complete(&self, id: &DocumentId) -> bool {
        let shard = self
            .shard_for(id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        shard
            .get(id)
            .is_some_and(|set| !set.tombstone && set.degraded == 0)
    }

    /// Live documents of `source_id` whose path lies under the directory
    /// `dir`, sorted.
    pub fn live_under(&self, source_id: &str, dir: &str) -> Vec<DocumentId> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut found = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            found.extend(
                shard
                    .iter()
                    .filter(|(id, set)| {
                        !set.tombstone && id.source_id == source_id && id.path.starts_with(&prefix)
                    })
                    .map(|(id, _)| id.clone()),
            );
        }
        found.sort();
        found
    }

    /// Drop the tombstone of `id` if it is still the one left at `version`.
    pub fn purge_tombstone(&self, id: &DocumentId, version: Version) -> bool {
        let mut shard = self
            .shard_for(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let matches = shard
            .get(id)
            .is_some_and(|set| set.tombstone && set.version == version);
        if matches {
            shard.remove(id);
        }
        matches
    }

    /// Number of tombstones currently held.
    pub fn tombstones(&self) -> usize {
        self.snapshot().iter().filter(|set| set.tombstone).count()
    }

    /// Store `entries` for `id` at `version` as-is, skipping every check.
    /// Lets tests plant entry sets that break the index invariants.
    #[cfg(any(test, feature = "testing"))]
    pub fn insert_unchecked(&self, id: &DocumentId, version: Version, entries: Vec<IndexEntry>) {
        self.shard_for(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                Arc::new(EntrySet {
                    version,
                    entries,
                    degraded: 0,
                    tombstone: false,
                }),
            );
    }

    pub fn state(&self, id: &DocumentId) -> DocumentState {
        let shard = self
            .shard_for(id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match shard.get(id) {
            Some(set) if !set.tombstone => DocumentState::Indexed {
                version: set.version,
            },
            _ => DocumentState::Absent,
        }
    }

    /// True when no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| {
            shard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .all(|set| set.tombstone || set.entries.is_empty())
        })
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        for set in self.snapshot().iter().filter(|set| !set.tombstone) {
            stats.documents += 1;
            stats.chunks += set.entries.len();
            stats.degraded_chunks += set.degraded;
        }
        let ms = self.last_update_ms.load(AtomicOrdering::Acquire);
        stats.last_update = (ms > 0)
            .then(|| DateTime::from_timestamp_millis(ms))
            .flatten();
        stats
    }

    /// Documents whose entry sets violate the index invariants: more than
    /// one entry for a chunk index, or entries from a version other than the
    /// set's own.
    pub fn check_integrity(&self) -> Vec<DocumentId> {
        let mut corrupted = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (id, set) in shard.iter() {
                if !is_consistent(set) {
                    corrupted.push(id.clone());
                }
            }
        }
        corrupted.sort();
        corrupted
    }

    /// Rebuild the entry set of `id` from its newest version, keeping one
    /// entry per chunk index.
    ///
    /// Returns `false` when the set was already consistent or is gone.
    pub fn repair(&self, id: &DocumentId) -> bool {
        let mut shard = self
            .shard_for(id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(current) = shard.get(id).cloned() else {
            return false;
        };
        if is_consistent(&current) {
            return false;
        }

        let version = current
            .entries
            .iter()
            .map(|e| e.metadata.version)
            .max()
            .unwrap_or(current.version)
            .max(current.version);
        let mut entries: Vec<IndexEntry> = current
            .entries
            .iter()
            .filter(|e| e.metadata.version == version)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.metadata.chunk_index);
        entries.dedup_by_key(|e| e.metadata.chunk_index);

        tracing::warn!(
            document = %id,
            version,
            kept = entries.len(),
            dropped = current.entries.len() - entries.len(),
            "repaired corrupted index entry set"
        );

        shard.insert(
            id.clone(),
            Arc::new(EntrySet {
                version,
                entries,
                degraded: current.degraded,
                tombstone: current.tombstone,
            }),
        );
        drop(shard);
        self.touch();
        true
    }

    fn snapshot(&self) -> Vec<Arc<EntrySet>> {
        let mut sets = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            sets.extend(shard.values().cloned());
        }
        sets
    }

    fn shard_for(&self, id: &DocumentId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis(), AtomicOrdering::Release);
    }
}

impl Default for IncrementalIndex {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

fn build_entry_set(
    document: &Document,
    id: &DocumentId,
    chunks: &[Chunk],
    vectors: &[EmbeddingVector],
) -> Result<EntrySet> {
    let mut by_chunk: HashMap<&str, &EmbeddingVector> = HashMap::with_capacity(vectors.len());
    for v in vectors {
        if by_chunk.insert(v.chunk_id.as_str(), v).is_some() {
            return Err(EngineError::MalformedInput(format!(
                "duplicate vector for chunk {}",
                v.chunk_id
            )));
        }
    }

    let dims = vectors.first().map(|v| v.vector.len());
    if vectors.iter().any(|v| Some(v.vector.len()) != dims) {
        return Err(EngineError::MalformedInput(format!(
            "inconsistent vector dimensions for {}",
            id
        )));
    }

    let mut seen = HashSet::with_capacity(chunks.len());
    let mut entries = Vec::with_capacity(vectors.len());
    let mut degraded = 0usize;

    for chunk in chunks {
        if &chunk.document_id != id || chunk.version != document.version {
            return Err(EngineError::MalformedInput(format!(
                "chunk {} does not belong to {} v{}",
                chunk.chunk_id(),
                id,
                document.version
            )));
        }
        if !seen.insert(chunk.chunk_index) {
            return Err(EngineError::MalformedInput(format!(
                "duplicate chunk index {} for {}",
                chunk.chunk_index, id
            )));
        }

        let chunk_id = chunk.chunk_id();
        match by_chunk.remove(chunk_id.as_str()) {
            Some(v) => entries.push(IndexEntry {
                chunk_id,
                vector: v.vector.clone(),
                metadata: EntryMetadata {
                    source_id: document.source_id.clone(),
                    path: document.path.clone(),
                    source_type: document.source_type,
                    chunk_index: chunk.chunk_index,
                    lines: chunk.lines,
                    version: chunk.version,
                    token_count: chunk.token_count,
                    text: chunk.text.clone(),
                },
            }),
            None => degraded += 1,
        }
    }

    if let Some(orphan) = by_chunk.keys().next() {
        return Err(EngineError::MalformedInput(format!(
            "vector for unknown chunk {}",
            orphan
        )));
    }

    entries.sort_by_key(|e| e.metadata.chunk_index);
    Ok(EntrySet {
        version: document.version,
        entries,
        degraded,
        tombstone: false,
    })
}

fn is_consistent(set: &EntrySet) -> bool {
    let mut seen = HashSet::with_capacity(set.entries.len());
    set.entries
        .iter()
        .all(|e| e.metadata.version == set.version && seen.insert(e.metadata.chunk_index))
}

fn rank(score_a: f32, a: &EntryMetadata, score_b: f32, b: &EntryMetadata) -> Ordering {
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.version.cmp(&a.version))
        .then_with(|| a.path.cmp(&b.path))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.chunk_index.cmp(&b.chunk_index))
}
