//! One-shot CLI commands: `lctx index` and `lctx query`.
//!
//! Both build a fresh in-memory engine, index the watch root directly
//! (no watcher, no debouncer) and print the result.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use live_context_core::retrieve::RetrieveRequest;

use crate::config::Config;
use crate::engine::{Engine, IndexSummary};
use crate::stats::print_stats;

/// Options of `lctx query`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub root: Option<PathBuf>,
    pub k: Option<usize>,
    pub min_score: Option<f32>,
    pub budget: Option<usize>,
}

fn resolve_root<'a>(config: &'a Config, root: Option<&'a Path>) -> Result<&'a Path> {
    root.or(config.watch.root.as_deref())
        .ok_or_else(|| anyhow!("No root to index. Pass --root or set [watch].root in the config."))
}

fn print_summary(root: &Path, summary: &IndexSummary) {
    println!(
        "Indexed {}: {} files ({} indexed, {} unchanged, {} failed)",
        root.display(),
        summary.files,
        summary.indexed,
        summary.unchanged,
        summary.failed
    );
}

/// Index the root and print counts.
pub async fn run_index(config: Config, root: Option<&Path>) -> Result<()> {
    let root = resolve_root(&config, root)?.to_path_buf();
    let engine = Engine::new(config)?;
    let summary = engine.index_root(&root).await?;
    print_summary(&root, &summary);
    println!();
    print_stats(&engine.statistics());
    Ok(())
}

/// Index the root, retrieve for `query`, and print the context payload.
pub async fn run_query(config: Config, query: &str, opts: QueryOptions) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    let root = resolve_root(&config, opts.root.as_deref())?.to_path_buf();
    let k = opts.k.unwrap_or(config.retrieval.default_k);
    let min_score = opts.min_score.unwrap_or(config.retrieval.min_score);
    let budget = opts.budget.unwrap_or(config.retrieval.context_token_budget);
    let timeout = config.retrieval.timeout();

    let engine = Engine::new(config)?;
    let summary = engine.index_root(&root).await?;
    tracing::debug!(?summary, "index built");

    let request = RetrieveRequest::new(query, k, min_score);
    let payload = engine.context(&request, budget, timeout).await?;

    if payload.sections.is_empty() {
        println!("No results.");
        return Ok(());
    }

    println!("{}", payload.text);
    println!();
    println!(
        "({} sections, ~{} tokens{})",
        payload.sections.len(),
        payload.token_estimate,
        if payload.truncated { ", truncated" } else { "" }
    );
    Ok(())
}
