//! Embedder trait, the deterministic hash embedder, and vector utilities.
//!
//! Concrete network providers (OpenAI, Ollama) and the retry/timeout wrapper
//! live in the `live-context` app crate. This module only defines the
//! interface they implement plus a provider that needs no network at all.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

/// Maps chunk text to fixed-dimension vectors.
///
/// Implementations must be safe to call concurrently, and embedding the same
/// text twice must produce vectors that rank interchangeably.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stored with every vector (e.g. `"text-embedding-3-small"`).
    fn model_tag(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::EmbeddingUnavailable("empty embedding response".into()))
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Default dimensionality of [`HashEmbedder`].
pub const DEFAULT_HASH_DIMS: usize = 256;

/// Deterministic feature-hashing embedder.
///
/// Each text is tokenized into lowercase identifier words. Every word
/// contributes a unigram feature plus its boundary-marked character
/// trigrams (`^re`, `ret`, ..., `rn$`), so `return` and `returns` land close
/// together. Features are hashed with SHA-256 into `dims` signed buckets and
/// the result is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    model_tag: String,
}

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model_tag: format!("hash-v1-{}", dims.max(1)),
        }
    }

    /// Override the model tag reported with each vector.
    pub fn with_model_tag(mut self, tag: impl Into<String>) -> Self {
        self.model_tag = tag.into();
        self
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];

        for word in words(text) {
            self.add_feature(&mut vector, &format!("w:{}", word), WORD_WEIGHT);

            let marked: Vec<char> = std::iter::once('^')
                .chain(word.chars())
                .chain(std::iter::once('$'))
                .collect();
            for tri in marked.windows(3) {
                let tri: String = tri.iter().collect();
                self.add_feature(&mut vector, &format!("t:{}", tri), TRIGRAM_WEIGHT);
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(bytes);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_tag(&self) -> &str {
        &self.model_tag
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercase identifier-like words (`[A-Za-z0-9_]+`).
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_hash_embedder_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_text("def f(): return 1");
        let b = e.embed_text("def f(): return 1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_empty_text_is_zero_vector() {
        let e = HashEmbedder::new(16);
        assert!(e.embed_text("  ... ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_hash_embedder_ranks_related_text_higher() {
        let e = HashEmbedder::default();
        let query = e.embed_text("f returns");
        let returns = e.embed_text("def f(): return 1");
        let unrelated = e.embed_text("kubernetes deployment manifest yaml");
        assert!(cosine_similarity(&query, &returns) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_embed_one_via_trait() {
        let e = HashEmbedder::new(32);
        let v = embed_one(&e, "hello world").await.unwrap();
        assert_eq!(v, e.embed_text("hello world"));
        assert_eq!(e.model_tag(), "hash-v1-32");
    }
}
