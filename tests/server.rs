//! HTTP API tests against a server bound to an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use live_context::config::Config;
use live_context::connector_webhook::WebhookReceiver;
use live_context::engine::Engine;
use live_context::server::{serve, AppState};
use live_context_core::context::PREAMBLE;
use async_trait::async_trait;
use live_context_core::embedding::{Embedder, HashEmbedder};
use live_context_core::models::SourceType;
use live_context_core::{EngineError, Result};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    base: String,
    engine: Arc<Engine>,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Refuses any text mentioning an outage, like a provider failing mid-query.
struct Outage(HashEmbedder);

#[async_trait]
impl Embedder for Outage {
    fn model_tag(&self) -> &str {
        "outage"
    }

    fn dims(&self) -> usize {
        self.0.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("outage")) {
            return Err(EngineError::EmbeddingUnavailable("503 from provider".into()));
        }
        self.0.embed(texts).await
    }
}

async fn start(config: Config) -> TestServer {
    start_with(config, Arc::new(HashEmbedder::new(128))).await
}

async fn start_with(config: Config, embedder: Arc<dyn Embedder>) -> TestServer {
    let engine = Engine::with_embedder(config.clone(), embedder).unwrap();
    let remote = engine.spawn_source(SourceType::Remote);
    let webhook = Arc::new(WebhookReceiver::new(config.webhook.clone(), remote.sink()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let state = AppState::new(Arc::clone(&engine), Some(webhook));
    tokio::spawn(async move {
        serve(listener, state, async {
            let _ = stop_rx.await;
        })
        .await
        .unwrap();
        remote.shutdown().await;
    });

    TestServer {
        base: format!("http://{}", addr),
        engine,
        stop: Some(stop_tx),
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.watch.debounce_ms = 10;
    config
}

async fn statistics(client: &reqwest::Client, base: &str) -> Value {
    client
        .get(format!("{}/v1/statistics", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_documents(server: &TestServer, n: usize) {
    for _ in 0..200 {
        if server.engine.statistics().documents_indexed == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("index never reached {} documents", n);
}

#[tokio::test]
async fn test_health() {
    let server = start(test_config()).await;
    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_malformed_webhook_is_rejected_without_state_change() {
    let server = start(test_config()).await;
    let client = reqwest::Client::new();
    let before = statistics(&client, &server.base).await;

    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .header("X-GitHub-Event", "push")
        .json(&json!({ "commitSha": "abc123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("changedFiles"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = statistics(&client, &server.base).await;
    assert_eq!(before, after);
    assert_eq!(after["documentsIndexed"], 0);
    assert_eq!(after["sourceHealth"]["remote"]["eventsProcessed"], 0);
}

#[tokio::test]
async fn test_webhook_then_retrieve() {
    let server = start(test_config()).await;
    let client = reqwest::Client::new();
    let payload = json!({
        "commitSha": "9fceb02",
        "ref": "refs/heads/main",
        "changedFiles": [
            {"path": "src/auth.rs", "status": "added",
             "content": "pub fn verify_token(token: &str) -> bool {\n    !token.is_empty()\n}\n"},
            {"path": "docs/setup.md", "status": "modified",
             "content": "# Setup\n\nRun the installer.\n"}
        ]
    });

    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .header("X-GitHub-Event", "push")
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["commitSha"], "9fceb02");

    wait_for_documents(&server, 2).await;

    let resp = client
        .post(format!("{}/v1/retrieve", server.base))
        .json(&json!({ "query": "verify token", "k": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["path"], "src/auth.rs");
    assert_eq!(results[0]["chunkIndex"], 0);
    assert_eq!(results[0]["lineRange"]["start"], 1);
    assert!(results[0]["text"].as_str().unwrap().contains("verify_token"));
    assert!(body["tookMs"].is_u64());

    // Redelivery of the same commit replays nothing.
    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .header("X-GitHub-Event", "push")
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "duplicate");

    let stats = statistics(&client, &server.base).await;
    assert_eq!(stats["documentsIndexed"], 2);
    assert_eq!(stats["sourceHealth"]["remote"]["status"], "ok");
    assert_eq!(stats["sourceHealth"]["local"]["status"], "disabled");
}

#[tokio::test]
async fn test_context_endpoint() {
    let server = start(test_config()).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/v1/webhook", server.base))
        .json(&json!({
            "commitSha": "c0ffee",
            "changedFiles": [
                {"path": "README.md", "status": "added", "content": "# Project\n\nHow to build the project.\n"}
            ]
        }))
        .send()
        .await
        .unwrap();
    wait_for_documents(&server, 1).await;

    let body: Value = client
        .post(format!("{}/v1/context", server.base))
        .json(&json!({ "query": "build the project", "tokenBudget": 500 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["text"].as_str().unwrap().starts_with(PREAMBLE));
    assert_eq!(body["sections"][0]["path"], "README.md");
    assert!(body["tokenEstimate"].as_u64().unwrap() <= 500);
    assert_eq!(body["truncated"], false);
}

#[tokio::test]
async fn test_query_validation_and_empty_index() {
    let server = start(test_config()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/retrieve", server.base))
        .json(&json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/v1/retrieve", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let body: Value = client
        .post(format!("{}/v1/retrieve", server.base))
        .json(&json!({ "query": "anything", "k": 5 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["results"], json!([]));
}

#[tokio::test]
async fn test_webhook_signature_and_filters() {
    let mut config = test_config();
    config.webhook.secret = Some("hunter2".to_string());
    config.webhook.branch = Some("main".to_string());
    let server = start(config).await;
    let client = reqwest::Client::new();
    let payload = json!({ "commitSha": "1", "changedFiles": [] }).to_string();

    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .header("X-Hub-Signature-256", "sha256=deadbeef")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    use hmac::{Hmac, Mac};
    let sign = |body: &str| {
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"hunter2").unwrap();
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    };

    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .header("X-GitHub-Event", "issues")
        .header("X-Hub-Signature-256", sign(&payload))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ignored event issues");

    let other_branch =
        json!({ "commitSha": "2", "ref": "refs/heads/dev", "changedFiles": [] }).to_string();
    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", sign(&other_branch))
        .body(other_branch)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ignored branch");
}

#[tokio::test]
async fn test_embedder_outage_on_query_is_503_with_default_config() {
    let server = start_with(Config::default(), Arc::new(Outage(HashEmbedder::new(128)))).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/webhook", server.base))
        .json(&json!({
            "commitSha": "0ut4ge",
            "changedFiles": [
                {"path": "ops/runbook.md", "status": "added", "content": "# Runbook\n\nRestart the worker.\n"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    wait_for_documents(&server, 1).await;

    let resp = client
        .post(format!("{}/v1/retrieve", server.base))
        .json(&json!({ "query": "outage runbook" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "embedder_unavailable");

    let stats = statistics(&client, &server.base).await;
    assert_eq!(stats["embedder"]["failures"], 0);
    assert_eq!(stats["queryEmbedder"]["attempts"], 1);
    assert_eq!(stats["queryEmbedder"]["failures"], 1);
    assert_eq!(stats["documentsIndexed"], 1);
}
