//! Per-path version authority.
//!
//! The [`VersionTracker`] is the single place versions are assigned. Version
//! numbers for a path start at 1 and strictly increase; assignment happens
//! under a lock so two racing events for one path can never receive the same
//! number. Only the latest record matters for correctness, older records are
//! kept (up to a small retention window) for diagnostics.
//!
//! Deleted paths are remembered so a recreated file continues its version
//! sequence. [`VersionTracker::evict_retired`] forgets the oldest of them;
//! paths first seen after an eviction start above every evicted version, so
//! the sequence of a path never goes backwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use crate::models::{DocumentId, Version, VersionRecord};

/// Default number of version records retained per path.
pub const DEFAULT_RETENTION: usize = 8;

/// Outcome of [`VersionTracker::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// The content differs from the latest recorded content; a new version
    /// was assigned.
    Assigned(VersionRecord),
    /// The content hash equals the latest recorded hash; nothing changed.
    Unchanged { version: Version },
}

#[derive(Debug, Default)]
struct PathHistory {
    latest: Version,
    /// Hash of the live content, `None` once the path is deleted.
    latest_hash: Option<String>,
    records: VecDeque<VersionRecord>,
}

#[derive(Debug, Default)]
struct Paths {
    histories: HashMap<DocumentId, PathHistory>,
    /// Deletions in the order they happened, with their tombstone version.
    retired: VecDeque<(DocumentId, Version)>,
    /// Highest version ever evicted; new histories start above it.
    floor: Version,
}

impl Paths {
    fn history(&mut self, id: &DocumentId) -> &mut PathHistory {
        let floor = self.floor;
        self.histories.entry(id.clone()).or_insert_with(|| PathHistory {
            latest: floor,
            ..PathHistory::default()
        })
    }
}

/// Assigns and records monotonically increasing versions per document.
#[derive(Debug)]
pub struct VersionTracker {
    retention: usize,
    paths: Mutex<Paths>,
}

impl VersionTracker {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            paths: Mutex::new(Paths::default()),
        }
    }

    /// Assign the next version for `id` unconditionally.
    pub fn next_version(&self, id: &DocumentId) -> Version {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let history = paths.history(id);
        let hash = history.latest_hash.clone();
        self.record(id, history, hash).version
    }

    /// Assign a new version for `id` carrying `content_hash`, unless the hash
    /// equals the latest live content hash.
    ///
    /// The comparison and the assignment happen in one critical section.
    pub fn advance(&self, id: &DocumentId, content_hash: &str) -> Advance {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let history = paths.history(id);
        if history.latest_hash.as_deref() == Some(content_hash) {
            return Advance::Unchanged {
                version: history.latest,
            };
        }
        Advance::Assigned(self.record(id, history, Some(content_hash.to_string())))
    }

    /// Record a deletion of `id`.
    ///
    /// Returns the tombstone version, or `None` when the path has no live
    /// content (never seen, or already deleted).
    pub fn retire(&self, id: &DocumentId) -> Option<Version> {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let history = paths.histories.get_mut(id)?;
        history.latest_hash.as_ref()?;
        let version = self.record(id, history, None).version;
        paths.retired.push_back((id.clone(), version));
        Some(version)
    }

    /// Forget the oldest deleted paths until at most `keep` deletions are
    /// remembered. Returns each forgotten path with its tombstone version.
    ///
    /// Paths recreated or deleted again since the recorded deletion are
    /// left alone.
    pub fn evict_retired(&self, keep: usize) -> Vec<(DocumentId, Version)> {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = Vec::new();
        while paths.retired.len() > keep {
            let Some((id, version)) = paths.retired.pop_front() else {
                break;
            };
            let still_retired = paths
                .histories
                .get(&id)
                .is_some_and(|h| h.latest == version && h.latest_hash.is_none());
            if still_retired {
                paths.histories.remove(&id);
                paths.floor = paths.floor.max(version);
                evicted.push((id, version));
            }
        }
        evicted
    }

    /// Number of paths with a recorded history, live or deleted.
    pub fn tracked(&self) -> usize {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.histories.len()
    }

    /// Latest version assigned for `id`.
    pub fn latest(&self, id: &DocumentId) -> Option<Version> {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.histories.get(id).map(|h| h.latest)
    }

    /// Whether `version` is still the latest version of `id`.
    pub fn is_current(&self, id: &DocumentId, version: Version) -> bool {
        self.latest(id) == Some(version)
    }

    /// Hash of the latest live content for `id`.
    pub fn latest_hash(&self, id: &DocumentId) -> Option<String> {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.histories.get(id).and_then(|h| h.latest_hash.clone())
    }

    /// Retained version records for `id`, oldest first.
    pub fn history(&self, id: &DocumentId) -> Vec<VersionRecord> {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths
            .histories
            .get(id)
            .map(|h| h.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(
        &self,
        id: &DocumentId,
        history: &mut PathHistory,
        content_hash: Option<String>,
    ) -> VersionRecord {
        history.latest += 1;
        history.latest_hash = content_hash.clone();
        let record = VersionRecord {
            source_id: id.source_id.clone(),
            path: id.path.clone(),
            version: history.latest,
            timestamp: Utc::now(),
            content_hash,
        };
        history.records.push_back(record.clone());
        while history.records.len() > self.retention {
            history.records.pop_front();
        }
        record
    }
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn id(path: &str) -> DocumentId {
        DocumentId::new("local", path)
    }

    #[test]
    fn test_versions_start_at_one_and_increase() {
        let tracker = VersionTracker::default();
        assert_eq!(tracker.latest(&id("a.py")), None);
        assert_eq!(tracker.next_version(&id("a.py")), 1);
        assert_eq!(tracker.next_version(&id("a.py")), 2);
        assert_eq!(tracker.next_version(&id("b.py")), 1);
        assert_eq!(tracker.latest(&id("a.py")), Some(2));
        assert!(tracker.is_current(&id("a.py"), 2));
        assert!(!tracker.is_current(&id("a.py"), 1));
    }

    #[test]
    fn test_advance_skips_identical_hash() {
        let tracker = VersionTracker::default();
        let a = id("a.py");
        assert!(matches!(tracker.advance(&a, "h1"), Advance::Assigned(r) if r.version == 1));
        assert_eq!(tracker.advance(&a, "h1"), Advance::Unchanged { version: 1 });
        assert!(matches!(tracker.advance(&a, "h2"), Advance::Assigned(r) if r.version == 2));
        assert_eq!(tracker.latest_hash(&a).as_deref(), Some("h2"));
    }

    #[test]
    fn test_retire_then_recreate_same_content() {
        let tracker = VersionTracker::default();
        let a = id("a.py");
        assert_eq!(tracker.retire(&a), None);
        tracker.advance(&a, "h1");
        assert_eq!(tracker.retire(&a), Some(2));
        assert_eq!(tracker.retire(&a), None);
        assert!(matches!(tracker.advance(&a, "h1"), Advance::Assigned(r) if r.version == 3));
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = VersionTracker::new(3);
        let a = id("a.py");
        for i in 0..10 {
            tracker.advance(&a, &format!("h{}", i));
        }
        let history = tracker.history(&a);
        assert_eq!(history.len(), 3);
        assert_eq!(history.first().map(|r| r.version), Some(8));
        assert_eq!(history.last().map(|r| r.version), Some(10));
    }

    #[test]
    fn test_evict_retired_keeps_versions_increasing() {
        let tracker = VersionTracker::default();
        let (a, b) = (id("a.py"), id("b.py"));
        tracker.advance(&a, "h1");
        tracker.advance(&a, "h2");
        tracker.advance(&b, "h1");
        assert_eq!(tracker.retire(&a), Some(3));
        assert_eq!(tracker.retire(&b), Some(2));

        assert_eq!(tracker.evict_retired(1), vec![(a.clone(), 3)]);
        assert_eq!(tracker.latest(&a), None);
        assert_eq!(tracker.latest(&b), Some(2));
        assert_eq!(tracker.tracked(), 1);

        // A recreated path continues above the evicted tombstone.
        assert!(matches!(tracker.advance(&a, "h1"), Advance::Assigned(r) if r.version == 4));
    }

    #[test]
    fn test_evict_skips_recreated_paths() {
        let tracker = VersionTracker::default();
        let a = id("a.py");
        tracker.advance(&a, "h1");
        tracker.retire(&a);
        tracker.advance(&a, "h2");

        assert!(tracker.evict_retired(0).is_empty());
        assert_eq!(tracker.latest(&a), Some(3));
    }

    #[test]
    fn test_concurrent_assignment_never_duplicates() {
        let tracker = Arc::new(VersionTracker::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| tracker.next_version(&id("hot.rs")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "version {} assigned twice", v);
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(tracker.latest(&id("hot.rs")), Some(800));
    }
}
