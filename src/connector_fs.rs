//! Local filesystem connector.
//!
//! Walks a root directory once at startup ([`initial_events`]) and then
//! follows it with a recursive `notify` watcher ([`LocalWatcher`]). Both
//! paths produce [`ChangeEvent`]s keyed by the file's `/`-joined path
//! relative to the root, so a file discovered by the scan and later
//! modified maps to the same document.
//!
//! Files are read by the Loader, not here. Any event for a path that no
//! longer exists is a deletion. Such a path may have been a directory moved
//! out of the root, so deletions skip the include globs (a directory never
//! matches `**/*.rs`) and the ingestor removes every document below it. A
//! directory moved into the root is scanned like the root at startup.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use live_context_core::models::SourceType;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::engine::EventSink;
use crate::models::{Change, ChangeEvent, ContentRef};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Capacity of the channel between the notify thread and the forwarder.
const NOTIFY_BUFFER: usize = 256;

/// Decides which files under a root belong to the local source.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl PathFilter {
    /// Build a filter for `root`, which is canonicalized.
    pub fn new(root: &Path, config: &WatchConfig) -> Result<Self> {
        if !root.is_dir() {
            bail!("watch root does not exist: {}", root.display());
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;

        let include = build_globset(&config.include_globs)?;
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            root,
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `/`-joined path of `path` relative to the root, or `None` when
    /// it lies outside the root or is filtered out.
    pub fn relative(&self, path: &Path) -> Option<String> {
        self.relative_dir(path)
            .filter(|rel| self.include.is_match(rel))
    }

    /// Like [`PathFilter::relative`] but ignoring the include globs, for
    /// paths that may name a directory.
    pub fn relative_dir(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel_str = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel_str.is_empty() || self.exclude.is_match(&rel_str) {
            return None;
        }
        Some(rel_str)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// One upsert event per matching file under `root`, sorted by path.
pub fn initial_events(root: &Path, config: &WatchConfig) -> Result<Vec<ChangeEvent>> {
    let filter = PathFilter::new(root, config)?;
    Ok(scan(&filter, filter.root()))
}

/// Upsert events for every matching file under `dir`, sorted by path.
fn scan(filter: &PathFilter, dir: &Path) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for entry in WalkDir::new(dir).follow_links(filter.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = filter.relative(entry.path()) else {
            continue;
        };
        events.push(ChangeEvent::new(
            SourceType::Local,
            rel,
            Change::Upsert(ContentRef::File(entry.path().to_path_buf())),
        ));
    }
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

/// Map one notify event path to a change, if it is one we care about.
fn change_for(kind: &EventKind, path: &Path) -> Option<Change> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Remove(_) => Some(Change::Delete),
        _ if !path.exists() => Some(Change::Delete),
        _ if path.is_dir() => None,
        _ => Some(Change::Upsert(ContentRef::File(path.to_path_buf()))),
    }
}

/// Whether `kind` may have brought a populated directory into the tree.
fn is_arrival(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)))
}

fn events_from(filter: &PathFilter, event: notify::Event) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for path in &event.paths {
        match change_for(&event.kind, path) {
            Some(Change::Delete) => {
                if let Some(rel) = filter.relative_dir(path) {
                    events.push(ChangeEvent::new(SourceType::Local, rel, Change::Delete));
                }
            }
            Some(change) => {
                if let Some(rel) = filter.relative(path) {
                    events.push(ChangeEvent::new(SourceType::Local, rel, change));
                }
            }
            None if is_arrival(&event.kind)
                && path.is_dir()
                && filter.relative_dir(path).is_some() =>
            {
                events.extend(scan(filter, path));
            }
            None => {}
        }
    }
    events
}

/// A running recursive watcher feeding the local source pipeline.
///
/// Dropping the watcher stops notifications; [`LocalWatcher::stop`] also
/// waits for the forwarder to finish.
pub struct LocalWatcher {
    watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
    root: PathBuf,
}

impl LocalWatcher {
    /// Start watching `root`.
    ///
    /// The watcher is registered before returning, so changes made after
    /// this call are observed.
    pub fn start(root: &Path, config: &WatchConfig, sink: EventSink) -> Result<Self> {
        let filter = PathFilter::new(root, config)?;
        let (notify_tx, mut notify_rx) = mpsc::channel::<ChangeEvent>(NOTIFY_BUFFER);

        let callback_filter = filter.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("file watcher error: {e}");
                    return;
                }
            };
            for change in events_from(&callback_filter, event) {
                if notify_tx.blocking_send(change).is_err() {
                    return;
                }
            }
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(filter.root(), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", filter.root().display()))?;

        let forwarder = tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                // Saturation is already logged by the sink.
                let _ = sink.emit(event).await;
            }
        });

        tracing::info!(root = %filter.root().display(), "watching for changes");
        Ok(Self {
            watcher,
            forwarder,
            root: filter.root().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching and wait until buffered notifications are forwarded.
    pub async fn stop(self) {
        let Self {
            watcher,
            forwarder,
            root,
        } = self;
        drop(watcher);
        if let Err(e) = forwarder.await {
            tracing::warn!(error = %e, "watcher forwarder failed");
        }
        tracing::info!(root = %root.display(), "stopped watching");
    }
}
