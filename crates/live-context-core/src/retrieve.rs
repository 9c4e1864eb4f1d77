//! Query-time retrieval against the incremental index.
//!
//! The retriever embeds the query text, asks the index for the nearest
//! entries, drops anything under `min_score`, and returns at most `k`
//! results in descending score order.
//!
//! When the query names a file (`main.py`, `README.md`), the retriever
//! over-fetches `4k` candidates and keeps the ones whose path ends with that
//! file name. If none match it falls back to the unfocused ranking.

use std::sync::Arc;

use crate::embedding::{embed_one, Embedder};
use crate::error::{EngineError, Result};
use crate::index::{IncrementalIndex, QueryFilter};
use crate::models::RetrievalResult;

/// Candidate multiplier used when the query focuses on one file name.
const FOCUS_OVERFETCH: usize = 4;

/// Parameters of a single retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveRequest {
    pub query: String,
    pub k: usize,
    pub min_score: f32,
    pub filter: QueryFilter,
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>, k: usize, min_score: f32) -> Self {
        Self {
            query: query.into(),
            k,
            min_score,
            filter: QueryFilter::default(),
        }
    }
}

/// Executes queries against a shared index.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<IncrementalIndex>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(index: Arc<IncrementalIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }

    pub fn index(&self) -> &Arc<IncrementalIndex> {
        &self.index
    }

    /// Retrieve with no filters.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>> {
        self.retrieve_with(&RetrieveRequest::new(query, k, min_score))
            .await
    }

    /// Retrieve the top `k` entries for `request`.
    ///
    /// An empty index yields an empty result without calling the embedder.
    /// The only error is [`EngineError::EmbedderUnavailable`].
    pub async fn retrieve_with(&self, request: &RetrieveRequest) -> Result<Vec<RetrievalResult>> {
        if request.k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = embed_one(self.embedder.as_ref(), &request.query)
            .await
            .map_err(|e| EngineError::EmbedderUnavailable(e.to_string()))?;

        let focus = focus_file_name(&request.query);
        let fetch = if focus.is_some() {
            request.k.saturating_mul(FOCUS_OVERFETCH)
        } else {
            request.k
        };

        let candidates: Vec<RetrievalResult> = self
            .index
            .query(&vector, fetch, &request.filter)
            .into_iter()
            .filter(|r| r.score >= request.min_score)
            .collect();

        let mut results = match focus {
            Some(name) => {
                let focused: Vec<RetrievalResult> = candidates
                    .iter()
                    .filter(|r| file_name(&r.metadata.path).eq_ignore_ascii_case(&name))
                    .cloned()
                    .collect();
                if focused.is_empty() {
                    tracing::debug!(file = %name, "no chunks match focused file name");
                    candidates
                } else {
                    focused
                }
            }
            None => candidates,
        };

        results.truncate(request.k);
        Ok(results)
    }
}

/// Extract a file name mentioned in `query`, e.g. `"what does main.py do"`
/// yields `main.py`.
///
/// A candidate is a whitespace-delimited word with a dot separating a
/// non-empty stem from a short extension that starts with a letter.
pub fn focus_file_name(query: &str) -> Option<String> {
    query
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| {
                !(c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
            })
            .trim_end_matches('.')
        })
        .filter_map(|w| {
            let name = file_name(w);
            let (stem, ext) = name.rsplit_once('.')?;
            let valid_ext = ext.len() <= 8
                && ext.starts_with(|c: char| c.is_ascii_alphabetic())
                && ext.chars().all(|c| c.is_ascii_alphanumeric());
            (!stem.is_empty() && valid_ext).then(|| name.to_string())
        })
        .next()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
