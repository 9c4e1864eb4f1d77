//! Loader / normalizer: raw change events in, versioned documents out.
//!
//! The Loader resolves an event's content (inline, file, or URL), rejects
//! anything that is not indexable text, hashes it, and asks the
//! [`VersionTracker`] for the next version. Content whose hash equals the
//! path's latest hash is reported as [`Loaded::Unchanged`] at the existing
//! version, and the ingestor skips it unless the index is missing part of
//! that document; this is what keeps noisy watchers cheap.
//!
//! Content fetch failures (file read races, network blips) are `TransientIo`
//! and retried here with bounded backoff. Everything else that makes an
//! event unusable is `MalformedInput` and drops that one event.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use live_context_core::models::{Document, DocumentId, Version};
use live_context_core::version::{Advance, VersionTracker};
use live_context_core::{EngineError, Result};
use sha2::{Digest, Sha256};

use crate::models::{Change, ChangeEvent, ContentRef};
use crate::retry::{io_error, with_retry, RetryPolicy};

/// Bytes inspected for NUL when sniffing binary content.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// What the Loader made of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    /// New content at a freshly assigned version.
    Document(Document),
    /// Same content as the latest version, carried at that version.
    Unchanged(Document),
    /// The path was deleted; its tombstone version.
    Deleted { id: DocumentId, version: Version },
    /// Deletion of a path that has no live content.
    Missing { id: DocumentId },
}

/// Converts [`ChangeEvent`]s into [`Loaded`] outcomes.
pub struct Loader {
    tracker: Arc<VersionTracker>,
    http: reqwest::Client,
    max_bytes: u64,
    retry: RetryPolicy,
}

impl Loader {
    pub fn new(
        tracker: Arc<VersionTracker>,
        max_bytes: u64,
        retry: RetryPolicy,
        fetch_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            tracker,
            http: reqwest::Client::builder().timeout(fetch_timeout).build()?,
            max_bytes,
            retry,
        })
    }

    pub fn tracker(&self) -> &Arc<VersionTracker> {
        &self.tracker
    }

    /// Resolve, validate and version one event.
    pub async fn load(&self, event: &ChangeEvent) -> Result<Loaded> {
        let id = event.document_id();
        let content_ref = match &event.change {
            Change::Delete => return Ok(self.retire(id)),
            Change::Upsert(content_ref) => content_ref,
        };

        let bytes = match self.fetch(content_ref).await? {
            Some(bytes) => bytes,
            // The file vanished between the event and the read.
            None => return Ok(self.retire(id)),
        };
        let content = self.decode(bytes)?;

        let content_hash = hash_content(&content);
        let advance = self.tracker.advance(&id, &content_hash);
        let document = |version| Document {
            source_id: id.source_id,
            path: id.path,
            content,
            content_hash,
            version,
            source_type: event.source_type,
        };
        Ok(match advance {
            Advance::Unchanged { version } => Loaded::Unchanged(document(version)),
            Advance::Assigned(record) => Loaded::Document(document(record.version)),
        })
    }

    fn retire(&self, id: DocumentId) -> Loaded {
        match self.tracker.retire(&id) {
            Some(version) => Loaded::Deleted { id, version },
            None => Loaded::Missing { id },
        }
    }

    /// Raw bytes of the referenced content; `None` when a file is gone.
    async fn fetch(&self, content_ref: &ContentRef) -> Result<Option<Vec<u8>>> {
        match content_ref {
            ContentRef::Inline(text) => {
                self.check_size(text.len() as u64)?;
                Ok(Some(text.clone().into_bytes()))
            }
            ContentRef::File(path) => {
                with_retry(&self.retry, "read_file", || self.read_file(path)).await
            }
            ContentRef::Url(url) => with_retry(&self.retry, "fetch_url", || self.fetch_url(url))
                .await
                .map(Some),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let context = path.display().to_string();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&context, e)),
        };
        if !meta.is_file() {
            return Err(EngineError::MalformedInput(format!("{} is not a regular file", context)));
        }
        self.check_size(meta.len())?;

        match tokio::fs::read(path).await {
            Ok(bytes) => {
                self.check_size(bytes.len() as u64)?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&context, e)),
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::TransientIo(format!("fetch {}: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::TransientIo(format!("fetch {}: HTTP {}", url, status)));
        }
        if !status.is_success() {
            return Err(EngineError::MalformedInput(format!("fetch {}: HTTP {}", url, status)));
        }
        if let Some(len) = response.content_length() {
            self.check_size(len)?;
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::TransientIo(format!("fetch {}: {}", url, e)))?;
        self.check_size(bytes.len() as u64)?;
        Ok(bytes.to_vec())
    }

    fn check_size(&self, len: u64) -> Result<()> {
        if len > self.max_bytes {
            return Err(EngineError::MalformedInput(format!(
                "content is {} bytes, limit is {}",
                len, self.max_bytes
            )));
        }
        Ok(())
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<String> {
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            return Err(EngineError::MalformedInput("binary content".to_string()));
        }
        String::from_utf8(bytes)
            .map_err(|e| EngineError::MalformedInput(format!("content is not UTF-8: {}", e)))
    }
}

/// SHA-256 hex digest of `content`.
pub fn hash_content(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
