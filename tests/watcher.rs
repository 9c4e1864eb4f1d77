//! Local watcher feeding a live engine.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use live_context::config::Config;
use live_context::connector_fs::{initial_events, LocalWatcher};
use live_context::engine::Engine;
use live_context_core::embedding::HashEmbedder;
use live_context_core::index::DocumentState;
use live_context_core::models::{DocumentId, SourceType};
use tempfile::TempDir;

fn config_for(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.watch.root = Some(dir.path().to_path_buf());
    config.watch.debounce_ms = 50;
    config
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_watcher_indexes_creates_modifies_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let engine = Engine::with_embedder(config.clone(), Arc::new(HashEmbedder::new(64))).unwrap();
    fs::create_dir_all(dir.path().join("pkg")).unwrap();
    let source = engine.spawn_source(SourceType::Local);
    let watcher = LocalWatcher::start(dir.path(), &config.watch, source.sink()).unwrap();

    let id = DocumentId::new("local", "pkg/mod.py");
    fs::write(dir.path().join("pkg/mod.py"), "def f(): pass\n").unwrap();
    eventually("create to be indexed", || {
        matches!(engine.index().state(&id), DocumentState::Indexed { .. })
    })
    .await;

    fs::write(dir.path().join("pkg/mod.py"), "def f(): return 1\n").unwrap();
    eventually("modification to be indexed", || {
        engine
            .index()
            .entries(&id)
            .map(|e| e.iter().all(|e| e.metadata.text.contains("return 1")))
            .unwrap_or(false)
    })
    .await;

    fs::remove_file(dir.path().join("pkg/mod.py")).unwrap();
    eventually("deletion to be applied", || {
        engine.index().state(&id) == DocumentState::Absent
    })
    .await;

    watcher.stop().await;
    source.shutdown().await;

    let local = engine.statistics().source_health.local;
    assert_eq!(local.events_failed, 0);
    assert!(local.events_processed >= 3);
}

#[tokio::test]
async fn test_ignored_directories_are_not_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let engine = Engine::with_embedder(config.clone(), Arc::new(HashEmbedder::new(64))).unwrap();
    let source = engine.spawn_source(SourceType::Local);
    fs::create_dir_all(dir.path().join("target/debug")).unwrap();
    let watcher = LocalWatcher::start(dir.path(), &config.watch, source.sink()).unwrap();

    fs::write(dir.path().join("target/debug/out.txt"), "build output").unwrap();
    fs::write(dir.path().join("kept.rs"), "fn kept() {}").unwrap();

    let kept = DocumentId::new("local", "kept.rs");
    eventually("kept.rs to be indexed", || {
        matches!(engine.index().state(&kept), DocumentState::Indexed { .. })
    })
    .await;

    watcher.stop().await;
    source.shutdown().await;
    assert_eq!(engine.statistics().documents_indexed, 1);
}

#[tokio::test]
async fn test_restart_scan_skips_unchanged_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
    fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();
    let config = config_for(&dir);
    let engine = Engine::with_embedder(config.clone(), Arc::new(HashEmbedder::new(64))).unwrap();

    let first = engine.index_root(dir.path()).await.unwrap();
    assert_eq!((first.files, first.indexed, first.unchanged), (2, 2, 0));

    fs::write(dir.path().join("b.rs"), "fn b() { changed() }").unwrap();
    let second = engine.index_root(dir.path()).await.unwrap();
    assert_eq!((second.files, second.indexed, second.unchanged), (2, 1, 1));

    assert_eq!(initial_events(dir.path(), &config.watch).unwrap().len(), 2);
}

#[tokio::test]
async fn test_directory_moved_out_removes_its_files() {
    let dir = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let engine = Engine::with_embedder(config.clone(), Arc::new(HashEmbedder::new(64))).unwrap();
    fs::create_dir_all(dir.path().join("pkg")).unwrap();
    fs::write(dir.path().join("keep.rs"), "fn keep() {}").unwrap();
    fs::write(dir.path().join("pkg/a.py"), "a = 1\n").unwrap();
    fs::write(dir.path().join("pkg/b.py"), "b = 2\n").unwrap();
    engine.index_root(dir.path()).await.unwrap();
    assert_eq!(engine.statistics().documents_indexed, 3);

    let source = engine.spawn_source(SourceType::Local);
    let watcher = LocalWatcher::start(dir.path(), &config.watch, source.sink()).unwrap();
    fs::rename(dir.path().join("pkg"), elsewhere.path().join("pkg")).unwrap();

    eventually("files under the moved directory to be removed", || {
        engine.index().live_under("local", "pkg").is_empty()
    })
    .await;

    watcher.stop().await;
    source.shutdown().await;
    let keep = DocumentId::new("local", "keep.rs");
    assert!(matches!(engine.index().state(&keep), DocumentState::Indexed { .. }));
    assert_eq!(engine.statistics().documents_indexed, 1);
}
