//! Per-path event coalescing between a watcher and its ingestion worker.
//!
//! Rapid repeated changes to one path collapse into a single event: the
//! newest event wins, and it is released `window` after the *first* event of
//! the burst, so a path that changes continuously still flushes regularly.
//! Events for different paths never delay each other beyond their own
//! windows, and per-path order is preserved across flushes.
//!
//! When the input channel closes, everything still pending is flushed
//! immediately before the task exits.

use std::collections::HashMap;
use std::time::Duration;

use live_context_core::models::DocumentId;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::models::ChangeEvent;

struct Pending {
    event: ChangeEvent,
    first_seen: Instant,
    seq: u64,
    coalesced: usize,
}

/// Pending events keyed by document.
#[derive(Default)]
struct PendingSet {
    entries: HashMap<DocumentId, Pending>,
    next_seq: u64,
}

impl PendingSet {
    fn insert(&mut self, event: ChangeEvent, now: Instant) {
        let key = event.document_id();
        match self.entries.get_mut(&key) {
            Some(pending) => {
                pending.event = event;
                pending.coalesced += 1;
            }
            None => {
                self.entries.insert(
                    key,
                    Pending {
                        event,
                        first_seen: now,
                        seq: self.next_seq,
                        coalesced: 0,
                    },
                );
                self.next_seq += 1;
            }
        }
    }

    fn next_deadline(&self, window: Duration) -> Option<Instant> {
        self.entries.values().map(|p| p.first_seen + window).min()
    }

    fn take_due(&mut self, now: Instant, window: Duration) -> Vec<ChangeEvent> {
        let due: Vec<DocumentId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.first_seen + window <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut taken: Vec<Pending> = due
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .collect();
        taken.sort_by_key(|p| p.seq);
        taken.into_iter().map(finish).collect()
    }

    fn drain_all(&mut self) -> Vec<ChangeEvent> {
        let mut taken: Vec<Pending> = self.entries.drain().map(|(_, p)| p).collect();
        taken.sort_by_key(|p| p.seq);
        taken.into_iter().map(finish).collect()
    }
}

fn finish(pending: Pending) -> ChangeEvent {
    if pending.coalesced > 0 {
        tracing::debug!(
            event = %pending.event,
            coalesced = pending.coalesced,
            "coalesced rapid changes"
        );
    }
    pending.event
}

/// Run the debouncer until `input` closes or `output` is dropped.
pub async fn run(
    mut input: mpsc::Receiver<ChangeEvent>,
    output: mpsc::Sender<ChangeEvent>,
    window: Duration,
) {
    let mut pending = PendingSet::default();

    loop {
        let deadline = pending.next_deadline(window);
        tokio::select! {
            received = input.recv() => match received {
                Some(event) => {
                    pending.insert(event, Instant::now());
                    if window.is_zero() && !forward(&output, pending.drain_all()).await {
                        return;
                    }
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if !forward(&output, pending.take_due(Instant::now(), window)).await {
                    return;
                }
            }
        }
    }

    forward(&output, pending.drain_all()).await;
}

/// Send `events` downstream, waiting for capacity. Returns `false` once the
/// receiver is gone.
async fn forward(output: &mpsc::Sender<ChangeEvent>, events: Vec<ChangeEvent>) -> bool {
    for event in events {
        if output.send(event).await.is_err() {
            tracing::debug!("debouncer output closed");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Change, ContentRef};
    use live_context_core::models::SourceType;

    fn upsert(path: &str, content: &str) -> ChangeEvent {
        ChangeEvent::new(
            SourceType::Local,
            path,
            Change::Upsert(ContentRef::Inline(content.to_string())),
        )
    }

    fn content(event: &ChangeEvent) -> &str {
        match &event.change {
            Change::Upsert(ContentRef::Inline(s)) => s,
            _ => "",
        }
    }

    fn spawn(window: Duration) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        tokio::spawn(run(in_rx, out_tx, window));
        (in_tx, out_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_within_window() {
        let (tx, mut rx) = spawn(Duration::from_millis(300));
        tx.send(upsert("a.py", "def f(): pass")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(upsert("a.py", "def f(): return 1")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(content(&event), "def f(): return 1");

        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_measured_from_first_event() {
        let (tx, mut rx) = spawn(Duration::from_millis(300));
        for i in 0..10 {
            tx.send(upsert("hot.rs", &i.to_string())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        drop(tx);

        let mut flushed = Vec::new();
        while let Some(event) = rx.recv().await {
            flushed.push(content(&event).to_string());
        }
        // A steady stream still flushes once the first window elapses.
        assert_eq!(flushed.len(), 2);
        assert_ne!(flushed[0], "9");
        assert_eq!(flushed[1], "9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_paths_flush_in_arrival_order() {
        let (tx, mut rx) = spawn(Duration::from_millis(100));
        tx.send(upsert("b.py", "1")).await.unwrap();
        tx.send(upsert("a.py", "2")).await.unwrap();
        tx.send(upsert("b.py", "3")).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.path.as_str(), content(&first)), ("b.py", "3"));
        assert_eq!(second.path, "a.py");
    }

    #[tokio::test]
    async fn test_close_drains_pending() {
        let (tx, mut rx) = spawn(Duration::from_secs(3600));
        tx.send(upsert("a.py", "x")).await.unwrap();
        tx.send(upsert("a.py", "y")).await.unwrap();
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(content(&event), "y");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_window_passes_through() {
        let (tx, mut rx) = spawn(Duration::ZERO);
        tx.send(upsert("a.py", "x")).await.unwrap();
        assert_eq!(content(&rx.recv().await.unwrap()), "x");
    }
}
