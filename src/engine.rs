//! The live engine: shared index, per-source pipelines, and the query path.
//!
//! ```text
//!  LocalWatcher ──┐                                   ┌──▶ Retriever ──▶ context::build
//!                 ├─▶ EventSink ─▶ debounce ─▶ worker ─┤
//!  Webhook ───────┘   (bounded)    (bounded)   (Ingestor)   IncrementalIndex
//! ```
//!
//! Each source gets its own bounded queue, debouncer task and ingestion
//! worker ([`Engine::spawn_source`]). The [`IncrementalIndex`] is the only
//! state shared between ingestion and queries, and queries are bounded by a
//! caller-supplied timeout. Ingestion and queries embed through separate
//! wrappers of the same provider, each with its own counters.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use live_context_core::context::{self, ContextPayload};
use live_context_core::embedding::Embedder;
use live_context_core::index::IncrementalIndex;
use live_context_core::models::{RetrievalResult, SourceType};
use live_context_core::retrieve::{RetrieveRequest, Retriever};
use live_context_core::version::VersionTracker;
use live_context_core::{EngineError, Result};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connector_fs;
use crate::debounce;
use crate::embedding::{create_embedder, RetryingEmbedder};
use crate::ingest::{run_worker, IngestOutcome, Ingestor};
use crate::loader::Loader;
use crate::models::ChangeEvent;
use crate::retry::RetryPolicy;
use crate::stats::{SourceHealthMap, SourceMonitor, Statistics};

/// Timeout for URL fetches performed by the Loader.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Entry point into one source's pipeline, cheap to clone.
///
/// Sends block for at most the configured emit timeout; past that the event
/// is dropped with a warning rather than buffered without bound.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::Sender<ChangeEvent>,
    timeout: Duration,
}

impl EventSink {
    pub fn new(sender: mpsc::Sender<ChangeEvent>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }

    /// Wait for queue space without a deadline. Used for the startup scan,
    /// where dropping events would leave files unindexed.
    pub async fn send(&self, event: ChangeEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| EngineError::TransientIo("ingestion pipeline closed".into()))
    }

    pub async fn emit(&self, event: ChangeEvent) -> Result<()> {
        match self.sender.send_timeout(event, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(event)) => {
                tracing::warn!(event = %event, "ingestion queue saturated, dropping event");
                Err(EngineError::TransientIo("ingestion queue saturated".into()))
            }
            Err(SendTimeoutError::Closed(event)) => {
                tracing::warn!(event = %event, "ingestion pipeline closed");
                Err(EngineError::TransientIo("ingestion pipeline closed".into()))
            }
        }
    }
}

/// Handle to a running source pipeline.
pub struct SourceHandle {
    sink: EventSink,
    debouncer: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl SourceHandle {
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.sink.emit(event).await
    }

    /// Close the pipeline and wait until every accepted event is processed.
    ///
    /// Completes once every clone of the sink has been dropped.
    pub async fn shutdown(self) {
        drop(self.sink);
        if let Err(e) = self.debouncer.await {
            tracing::warn!(error = %e, "debouncer task failed");
        }
        if let Err(e) = self.worker.await {
            tracing::warn!(error = %e, "ingestion worker failed");
        }
    }
}

/// Summary of a one-shot [`Engine::index_root`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub files: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Owns the index and everything that reads or writes it.
pub struct Engine {
    config: Config,
    index: Arc<IncrementalIndex>,
    embedder: Arc<RetryingEmbedder>,
    query_embedder: Arc<RetryingEmbedder>,
    ingestor: Arc<Ingestor>,
    retriever: Retriever,
    local: Arc<SourceMonitor>,
    remote: Arc<SourceMonitor>,
}

impl Engine {
    /// Build an engine with the provider named in `config.embedding`.
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let provider = create_embedder(&config.embedding)?;
        Self::with_embedder(config, provider)
    }

    /// Build an engine around an explicit embedding provider.
    ///
    /// Ingestion wraps the provider with the configured timeout and retry
    /// policy. Queries get their own wrapper without retries and with a call
    /// timeout no longer than the query deadline, so a provider outage
    /// surfaces as `EmbedderUnavailable` instead of a query timeout.
    pub fn with_embedder(config: Config, provider: Arc<dyn Embedder>) -> anyhow::Result<Arc<Self>> {
        let embedder = Arc::new(RetryingEmbedder::new(
            Arc::clone(&provider),
            RetryPolicy::from_config(&config.embedding),
            config.embedding.timeout(),
        ));
        let query_embedder = Arc::new(RetryingEmbedder::new(
            provider,
            RetryPolicy::none(),
            config.embedding.timeout().min(config.retrieval.timeout()),
        ));
        let index = Arc::new(IncrementalIndex::new(config.index.shards));
        let tracker = Arc::new(VersionTracker::new(config.index.version_retention));
        let loader = Arc::new(Loader::new(
            tracker,
            config.watch.max_file_bytes,
            RetryPolicy::from_config(&config.embedding),
            FETCH_TIMEOUT,
        )?);

        let ingestor = Arc::new(
            Ingestor::new(
                loader,
                Arc::clone(&index),
                embedder.clone(),
                config.chunking.max_tokens,
                config.embedding.concurrency,
            )
            .with_max_tombstones(config.index.max_tombstones),
        );
        let retriever = Retriever::new(Arc::clone(&index), query_embedder.clone());

        Ok(Arc::new(Self {
            config,
            index,
            embedder,
            query_embedder,
            ingestor,
            retriever,
            local: Arc::new(SourceMonitor::disabled()),
            remote: Arc::new(SourceMonitor::disabled()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<IncrementalIndex> {
        &self.index
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    fn monitor(&self, source_type: SourceType) -> &Arc<SourceMonitor> {
        match source_type {
            SourceType::Local => &self.local,
            SourceType::Remote => &self.remote,
        }
    }

    /// Start the debouncer and ingestion worker for one source.
    pub fn spawn_source(&self, source_type: SourceType) -> SourceHandle {
        let capacity = self.config.watch.queue_capacity;
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (debounced_tx, debounced_rx) = mpsc::channel(capacity);

        let monitor = Arc::clone(self.monitor(source_type));
        monitor.enable();

        let debouncer = tokio::spawn(debounce::run(
            raw_rx,
            debounced_tx,
            self.config.watch.debounce(),
        ));
        let worker = tokio::spawn(run_worker(
            Arc::clone(&self.ingestor),
            debounced_rx,
            monitor,
        ));
        tracing::info!(source = %source_type, capacity, "source pipeline started");

        SourceHandle {
            sink: EventSink::new(raw_tx, self.config.watch.emit_timeout()),
            debouncer,
            worker,
        }
    }

    /// Retrieve under `timeout`. Expiry leaves the index untouched.
    pub async fn retrieve(
        &self,
        request: &RetrieveRequest,
        timeout: Duration,
    ) -> Result<Vec<RetrievalResult>> {
        tokio::time::timeout(timeout, self.retriever.retrieve_with(request))
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    /// Retrieve and assemble a context payload within `token_budget`.
    pub async fn context(
        &self,
        request: &RetrieveRequest,
        token_budget: usize,
        timeout: Duration,
    ) -> Result<ContextPayload> {
        let results = self.retrieve(request, timeout).await?;
        Ok(context::build(&results, token_budget))
    }

    pub fn statistics(&self) -> Statistics {
        Statistics::new(
            self.index.stats(),
            SourceHealthMap {
                local: self.local.snapshot(),
                remote: self.remote.snapshot(),
            },
            self.embedder.counters(),
            self.query_embedder.counters(),
        )
    }

    /// Check every document's entry set and heal the broken ones.
    ///
    /// A broken set is first trimmed to its newest version so queries stop
    /// seeing duplicates, then the document is loaded, split and embedded
    /// again in full. Returns the number of healed documents.
    pub async fn sweep_integrity(&self) -> usize {
        let mut healed = 0;
        for id in self.index.check_integrity() {
            let err = EngineError::IndexCorruption {
                document: id.to_string(),
            };
            tracing::warn!(error = %err, "self-healing index entry set");
            let trimmed = self.index.repair(&id);
            match self.ingestor.reindex(&id).await {
                Ok(Some(outcome)) => {
                    tracing::info!(document = %id, outcome = ?outcome, "re-upserted document");
                    healed += 1;
                }
                Ok(None) if trimmed => healed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        document = %id,
                        error = %e,
                        "re-upsert failed, keeping trimmed entries"
                    );
                    if trimmed {
                        healed += 1;
                    }
                }
            }
        }
        healed
    }

    /// Run [`Engine::sweep_integrity`] every `interval` until aborted.
    pub fn spawn_integrity_sweep(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let healed = engine.sweep_integrity().await;
                if healed > 0 {
                    tracing::info!(healed, "integrity sweep finished");
                }
            }
        })
    }

    /// Index every file under `root` directly, bypassing the debouncer.
    pub async fn index_root(&self, root: &Path) -> anyhow::Result<IndexSummary> {
        if !root.is_dir() {
            bail!("watch root does not exist: {}", root.display());
        }
        let events = connector_fs::initial_events(root, &self.config.watch)
            .with_context(|| format!("Failed to scan {}", root.display()))?;

        let mut summary = IndexSummary {
            files: events.len(),
            ..IndexSummary::default()
        };
        for event in &events {
            match self.ingestor.process(event).await {
                Ok(IngestOutcome::Indexed { .. }) => {
                    summary.indexed += 1;
                    self.local.record_success();
                }
                Ok(_) => {
                    summary.unchanged += 1;
                    self.local.record_success();
                }
                Err(e) => {
                    tracing::warn!(event = %event, error = %e, "skipping file");
                    summary.failed += 1;
                    self.local.record_failure(&e);
                }
            }
        }
        Ok(summary)
    }
}
