//! Remote repository webhook connector.
//!
//! Receives commit payloads and turns each changed file into a
//! [`ChangeEvent`] on the remote source's pipeline.
//!
//! # Payload
//!
//! ```json
//! {
//!   "commitSha": "9fceb02",
//!   "ref": "refs/heads/main",
//!   "changedFiles": [
//!     { "path": "src/lib.rs", "status": "modified", "content": "..." },
//!     { "path": "docs/api.md", "status": "added", "contentUrl": "https://..." },
//!     { "path": "old.py", "status": "removed" }
//!   ]
//! }
//! ```
//!
//! A payload that fails validation is rejected as a whole: nothing is
//! emitted and no counter moves. Deliveries whose `X-GitHub-Event` is not a
//! repository-mutating event, or whose `ref` names another branch, are
//! acknowledged and ignored. A commit SHA that was already accepted is
//! acknowledged without emitting anything, so redelivery replays nothing.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use hmac::{Hmac, Mac};
use live_context_core::models::SourceType;
use live_context_core::EngineError;
use serde::Deserialize;
use sha2::Sha256;

use crate::config::WebhookConfig;
use crate::engine::EventSink;
use crate::models::{Change, ChangeEvent, ContentRef};

/// `X-GitHub-Event` values that change repository content.
const REPO_MUTATING_EVENTS: &[&str] = &["push", "pull_request", "create", "delete", "release"];

/// Number of accepted commit SHAs remembered for redelivery detection.
const RECENT_SHA_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    commit_sha: Option<String>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    changed_files: Option<Vec<RawChangedFile>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangedFile {
    path: Option<String>,
    status: Option<String>,
    content: Option<String>,
    content_url: Option<String>,
}

/// A validated commit payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPush {
    pub commit_sha: String,
    pub git_ref: Option<String>,
    pub changes: Vec<(String, Change)>,
}

impl CommitPush {
    fn into_events(self) -> Vec<ChangeEvent> {
        let sha = self.commit_sha;
        self.changes
            .into_iter()
            .map(|(path, change)| {
                ChangeEvent::new(SourceType::Remote, path, change).with_origin(sha.clone())
            })
            .collect()
    }
}

/// Parse and validate a payload body.
pub fn parse_payload(body: &[u8]) -> Result<CommitPush, EngineError> {
    let raw: RawPayload = serde_json::from_slice(body)
        .map_err(|e| malformed(format!("invalid JSON payload: {}", e)))?;

    let commit_sha = raw
        .commit_sha
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| malformed("missing commitSha"))?;
    let files = raw
        .changed_files
        .ok_or_else(|| malformed("missing changedFiles"))?;

    let mut changes = Vec::with_capacity(files.len());
    for (i, file) in files.into_iter().enumerate() {
        let path = file
            .path
            .ok_or_else(|| malformed(format!("changedFiles[{}]: missing path", i)))?;
        validate_path(&path).map_err(|reason| malformed(format!("changedFiles[{}]: {}", i, reason)))?;

        let change = match file.status.as_deref() {
            Some("removed") => Change::Delete,
            Some("added") | Some("modified") => match (file.content, file.content_url) {
                (Some(content), _) => Change::Upsert(ContentRef::Inline(content)),
                (None, Some(url)) if url.starts_with("http://") || url.starts_with("https://") => {
                    Change::Upsert(ContentRef::Url(url))
                }
                (None, Some(url)) => {
                    return Err(malformed(format!("changedFiles[{}]: unsupported contentUrl {}", i, url)))
                }
                (None, None) => {
                    return Err(malformed(format!(
                        "changedFiles[{}]: content or contentUrl required",
                        i
                    )))
                }
            },
            Some(other) => {
                return Err(malformed(format!("changedFiles[{}]: unknown status '{}'", i, other)))
            }
            None => return Err(malformed(format!("changedFiles[{}]: missing status", i))),
        };
        changes.push((path, change));
    }

    Ok(CommitPush {
        commit_sha,
        git_ref: raw.git_ref,
        changes,
    })
}

fn validate_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("empty path");
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err("path must be relative and '/'-separated");
    }
    if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err("path contains an empty, '.' or '..' component");
    }
    Ok(())
}

fn malformed(message: impl Into<String>) -> EngineError {
    EngineError::MalformedInput(message.into())
}

/// Check an `X-Hub-Signature-256` header (`sha256=<hex hmac>`) against `body`.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Why a delivery was refused.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid or missing signature")]
    Unauthorized,
    #[error(transparent)]
    Malformed(EngineError),
    #[error(transparent)]
    Unavailable(EngineError),
}

/// What happened to an acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Accepted { commit_sha: String, accepted: usize },
    Duplicate { commit_sha: String },
    Ignored(String),
}

/// Bounded memory of accepted commit SHAs.
#[derive(Default)]
struct RecentShas {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl RecentShas {
    /// Returns `false` if `sha` was already present.
    fn claim(&mut self, sha: &str) -> bool {
        if self.set.contains(sha) {
            return false;
        }
        self.set.insert(sha.to_string());
        self.order.push_back(sha.to_string());
        while self.order.len() > RECENT_SHA_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    fn release(&mut self, sha: &str) {
        self.set.remove(sha);
        self.order.retain(|s| s != sha);
    }
}

/// Validates deliveries and feeds the remote source pipeline.
pub struct WebhookReceiver {
    config: WebhookConfig,
    sink: EventSink,
    recent: Mutex<RecentShas>,
}

impl WebhookReceiver {
    pub fn new(config: WebhookConfig, sink: EventSink) -> Self {
        Self {
            config,
            sink,
            recent: Mutex::new(RecentShas::default()),
        }
    }

    /// Handle one delivery.
    ///
    /// `event_type` is the `X-GitHub-Event` header. Deliveries without it are
    /// treated as plain commit pushes.
    pub async fn receive(
        &self,
        event_type: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookError> {
        if let Some(secret) = &self.config.secret {
            if !verify_signature(secret, body, signature) {
                tracing::warn!("rejected webhook with bad signature");
                return Err(WebhookError::Unauthorized);
            }
        }

        if let Some(kind) = event_type {
            if !REPO_MUTATING_EVENTS.contains(&kind) {
                return Ok(WebhookOutcome::Ignored(format!("ignored event {}", kind)));
            }
        }

        let push = parse_payload(body).map_err(|e| {
            tracing::warn!(error = %e, "rejected malformed webhook payload");
            WebhookError::Malformed(e)
        })?;

        if let (Some(branch), Some(git_ref)) = (&self.config.branch, &push.git_ref) {
            if git_ref != branch && *git_ref != format!("refs/heads/{}", branch) {
                return Ok(WebhookOutcome::Ignored("ignored branch".to_string()));
            }
        }

        let commit_sha = push.commit_sha.clone();
        if !self.recent().claim(&commit_sha) {
            tracing::debug!(commit = %commit_sha, "commit already accepted");
            return Ok(WebhookOutcome::Duplicate { commit_sha });
        }

        let events = push.into_events();
        let accepted = events.len();
        for event in events {
            if let Err(e) = self.sink.emit(event).await {
                // Let a redelivery retry the whole commit.
                self.recent().release(&commit_sha);
                return Err(WebhookError::Unavailable(e));
            }
        }

        tracing::info!(commit = %commit_sha, files = accepted, "accepted webhook commit");
        Ok(WebhookOutcome::Accepted {
            commit_sha,
            accepted,
        })
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentShas> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_parse_valid_payload() {
        let body = br#"{
            "commitSha": "abc123",
            "ref": "refs/heads/main",
            "changedFiles": [
                {"path": "a.py", "status": "added", "content": "x = 1"},
                {"path": "docs/b.md", "status": "modified", "contentUrl": "https://example.com/b.md"},
                {"path": "c.py", "status": "removed"}
            ]
        }"#;
        let push = parse_payload(body).unwrap();
        assert_eq!(push.commit_sha, "abc123");
        assert_eq!(push.changes.len(), 3);
        assert_eq!(push.changes[0].1, Change::Upsert(ContentRef::Inline("x = 1".into())));
        assert!(matches!(push.changes[1].1, Change::Upsert(ContentRef::Url(_))));
        assert_eq!(push.changes[2].1, Change::Delete);

        let events = push.into_events();
        assert!(events.iter().all(|e| e.origin.as_deref() == Some("abc123")));
        assert!(events.iter().all(|e| e.source_id == "remote"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let cases: &[&[u8]] = &[
            b"not json",
            br#"{"commitSha": "abc"}"#,
            br#"{"changedFiles": []}"#,
            br#"{"commitSha": " ", "changedFiles": []}"#,
            br#"{"commitSha": "a", "changedFiles": [{"path": "a.py", "status": "renamed", "content": ""}]}"#,
            br#"{"commitSha": "a", "changedFiles": [{"path": "a.py", "status": "added"}]}"#,
            br#"{"commitSha": "a", "changedFiles": [{"path": "../etc/passwd", "status": "removed"}]}"#,
            br#"{"commitSha": "a", "changedFiles": [{"path": "/abs", "status": "removed"}]}"#,
            br#"{"commitSha": "a", "changedFiles": [{"path": "a.py", "status": "added", "contentUrl": "file:///x"}]}"#,
        ];
        for body in cases {
            let err = parse_payload(body).unwrap_err();
            assert!(
                matches!(err, EngineError::MalformedInput(_)),
                "expected rejection for {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_empty_changed_files_is_valid() {
        let push = parse_payload(br#"{"commitSha": "a", "changedFiles": []}"#).unwrap();
        assert!(push.changes.is_empty());
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"commitSha":"a","changedFiles":[]}"#;
        let good = sign("s3cr3t", body);
        assert!(verify_signature("s3cr3t", body, Some(&good)));
        assert!(!verify_signature("other", body, Some(&good)));
        assert!(!verify_signature("s3cr3t", b"tampered", Some(&good)));
        assert!(!verify_signature("s3cr3t", body, None));
        assert!(!verify_signature("s3cr3t", body, Some("sha1=abc")));
        assert!(!verify_signature("s3cr3t", body, Some("sha256=zz")));
    }

    #[test]
    fn test_recent_shas_bounded() {
        let mut recent = RecentShas::default();
        assert!(recent.claim("a"));
        assert!(!recent.claim("a"));
        for i in 0..RECENT_SHA_CAPACITY {
            recent.claim(&i.to_string());
        }
        assert!(recent.claim("a"));
        recent.release("a");
        assert!(recent.claim("a"));
    }

    fn receiver(config: WebhookConfig) -> (WebhookReceiver, tokio::sync::mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let sink = EventSink::new(tx, std::time::Duration::from_secs(1));
        (WebhookReceiver::new(config, sink), rx)
    }

    #[tokio::test]
    async fn test_receive_filters_and_dedups() {
        let config = WebhookConfig {
            enabled: true,
            secret: None,
            branch: Some("main".to_string()),
        };
        let (recv, mut rx) = receiver(config);
        let body = br#"{"commitSha":"c1","ref":"refs/heads/main","changedFiles":[{"path":"a.py","status":"added","content":"x"}]}"#;

        let out = recv.receive(Some("issues"), None, body).await.unwrap();
        assert_eq!(out, WebhookOutcome::Ignored("ignored event issues".into()));

        let other = br#"{"commitSha":"c2","ref":"refs/heads/dev","changedFiles":[]}"#;
        let out = recv.receive(Some("push"), None, other).await.unwrap();
        assert_eq!(out, WebhookOutcome::Ignored("ignored branch".into()));

        let out = recv.receive(Some("push"), None, body).await.unwrap();
        assert_eq!(
            out,
            WebhookOutcome::Accepted {
                commit_sha: "c1".into(),
                accepted: 1
            }
        );
        assert_eq!(rx.recv().await.unwrap().path, "a.py");

        let out = recv.receive(Some("push"), None, body).await.unwrap();
        assert_eq!(out, WebhookOutcome::Duplicate { commit_sha: "c1".into() });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receive_requires_signature_when_configured() {
        let config = WebhookConfig {
            enabled: true,
            secret: Some("k".to_string()),
            branch: None,
        };
        let (recv, mut rx) = receiver(config);
        let body = br#"{"commitSha":"c1","changedFiles":[{"path":"a.py","status":"removed"}]}"#;

        let err = recv.receive(None, Some("sha256=00"), body).await.unwrap_err();
        assert!(matches!(err, WebhookError::Unauthorized));
        assert!(rx.try_recv().is_err());

        let sig = sign("k", body);
        let out = recv.receive(None, Some(&sig), body).await.unwrap();
        assert!(matches!(out, WebhookOutcome::Accepted { accepted: 1, .. }));
    }

    #[tokio::test]
    async fn test_malformed_payload_emits_nothing() {
        let (recv, mut rx) = receiver(WebhookConfig::default());
        let err = recv
            .receive(Some("push"), None, br#"{"commitSha":"c1"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Malformed(_)));
        assert!(rx.try_recv().is_err());
    }
}
