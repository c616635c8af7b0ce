//! TTL caches for embeddings and model answers.
//!
//! Both tiers sit on `moka::sync::Cache`, keyed by a SHA-256 digest of the
//! normalized inputs. Hits and misses are counted by the caller in
//! [`PipelineMetrics`](crate::metrics::PipelineMetrics).

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::types::Language;

/// Cached entity type. Each tier has its own lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Embedding,
    Answer,
}

impl CacheTier {
    pub fn ttl(self, config: &CacheConfig) -> Duration {
        match self {
            CacheTier::Embedding => Duration::from_secs(config.embedding_ttl_secs),
            CacheTier::Answer => Duration::from_secs(config.answer_ttl_secs),
        }
    }
}

/// Hex SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    fn digest(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f_u8]);
            }
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Key for an embedding of `text` produced by `embedder`.
    pub fn for_embedding(text: &str, embedder: &str) -> Self {
        Self::digest(&[&normalize_query(text), embedder])
    }

    /// Key for a model answer.
    ///
    /// Only the first `prefix_bytes` of the rendered context contribute.
    /// The context keeps its case; the query does not.
    pub fn for_answer(
        context: &str,
        query: &str,
        language: &Language,
        provider: &str,
        prefix_bytes: usize,
    ) -> Self {
        let context = collapse_whitespace(context);
        Self::digest(&[
            truncate_bytes(&context, prefix_bytes),
            &normalize_query(query),
            language.code(),
            provider,
        ])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase and collapse whitespace.
fn normalize_query(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// A bounded cache with a fixed time-to-live per entry.
pub struct TtlCache<V: Clone + Send + Sync + 'static> {
    tier: CacheTier,
    inner: Cache<CacheKey, V>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(tier: CacheTier, config: &CacheConfig) -> Self {
        let inner = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(tier.ttl(config))
            .build();
        Self { tier, inner }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let value = self.inner.get(key);
        tracing::trace!(tier = ?self.tier, key = %key, hit = value.is_some(), "Cache lookup");
        value
    }

    pub fn insert(&self, key: CacheKey, value: V) {
        self.inner.insert(key, value);
    }
}

/// A cached model answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub text: String,
    pub provider: String,
}

pub type EmbeddingCache = TtlCache<Arc<Vec<f32>>>;
pub type ResponseCache = TtlCache<CachedAnswer>;

impl EmbeddingCache {
    pub fn embeddings(config: &CacheConfig) -> Self {
        TtlCache::new(CacheTier::Embedding, config)
    }
}

impl ResponseCache {
    pub fn answers(config: &CacheConfig) -> Self {
        TtlCache::new(CacheTier::Answer, config)
    }
}
