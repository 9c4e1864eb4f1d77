//! Engine statistics and per-source health.
//!
//! Backs `GET /v1/statistics` and the CLI summaries. Counters move only when
//! an ingestion worker finishes an event; rejected webhook payloads never
//! reach a worker, so they leave every number here untouched.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use live_context_core::index::IndexStats;
use live_context_core::EngineError;
use serde::Serialize;

use crate::embedding::EmbedderCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// The last event was processed successfully.
    Ok,
    /// Enabled, no event seen yet.
    Idle,
    /// Not configured.
    Disabled,
    /// The last event failed.
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Ok => "ok",
            SourceStatus::Idle => "idle",
            SourceStatus::Disabled => "disabled",
            SourceStatus::Error => "error",
        }
    }
}

/// Health of one source pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub status: SourceStatus,
    pub events_processed: u64,
    pub events_failed: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SourceHealth {
    fn new(status: SourceStatus) -> Self {
        Self {
            status,
            events_processed: 0,
            events_failed: 0,
            last_event_at: None,
            last_error: None,
        }
    }
}

/// Tracks the health of one source, updated by its ingestion worker.
#[derive(Debug)]
pub struct SourceMonitor {
    state: Mutex<SourceHealth>,
}

impl SourceMonitor {
    pub fn disabled() -> Self {
        Self {
            state: Mutex::new(SourceHealth::new(SourceStatus::Disabled)),
        }
    }

    /// Mark the source as running. Leaves counters untouched.
    pub fn enable(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.status == SourceStatus::Disabled {
            state.status = SourceStatus::Idle;
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.status = SourceStatus::Ok;
        state.events_processed += 1;
        state.last_event_at = Some(Utc::now());
    }

    pub fn record_failure(&self, err: &EngineError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.status = SourceStatus::Error;
        state.events_processed += 1;
        state.events_failed += 1;
        state.last_event_at = Some(Utc::now());
        state.last_error = Some(err.to_string());
    }

    pub fn snapshot(&self) -> SourceHealth {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealthMap {
    pub local: SourceHealth,
    pub remote: SourceHealth,
}

/// Response body of `GET /v1/statistics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub documents_indexed: usize,
    pub chunks_indexed: usize,
    pub degraded_chunks: usize,
    pub last_update_timestamp: Option<DateTime<Utc>>,
    pub source_health: SourceHealthMap,
    /// Provider calls made by ingestion.
    pub embedder: EmbedderCounters,
    /// Provider calls made by queries.
    pub query_embedder: EmbedderCounters,
}

impl Statistics {
    pub fn new(
        index: IndexStats,
        source_health: SourceHealthMap,
        embedder: EmbedderCounters,
        query_embedder: EmbedderCounters,
    ) -> Self {
        Self {
            documents_indexed: index.documents,
            chunks_indexed: index.chunks,
            degraded_chunks: index.degraded_chunks,
            last_update_timestamp: index.last_update,
            source_health,
            embedder,
            query_embedder,
        }
    }
}

/// Print a human-readable summary.
pub fn print_stats(stats: &Statistics) {
    println!("Live Context index stats");
    println!();
    println!("  Documents:       {}", stats.documents_indexed);
    println!("  Chunks:          {}", stats.chunks_indexed);
    println!("  Degraded chunks: {}", stats.degraded_chunks);
    match &stats.last_update_timestamp {
        Some(ts) => println!("  Last update:     {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last update:     never"),
    }
    println!(
        "  Embedder:        {} calls, {} failed",
        stats.embedder.attempts, stats.embedder.failures
    );
    println!(
        "  Query embedder:  {} calls, {} failed",
        stats.query_embedder.attempts, stats.query_embedder.failures
    );
    println!();
    println!("  {:<10} {:<10} {:>8} {:>8}", "SOURCE", "STATUS", "EVENTS", "FAILED");
    for (name, health) in [
        ("local", &stats.source_health.local),
        ("remote", &stats.source_health.remote),
    ] {
        println!(
            "  {:<10} {:<10} {:>8} {:>8}",
            name,
            health.status.as_str(),
            health.events_processed,
            health.events_failed
        );
        if let Some(err) = &health.last_error {
            println!("             last error: {}", err);
        }
    }
    println!();
}
