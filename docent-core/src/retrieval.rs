//! Retrieval: query text to ranked, filtered chunks with their owning pages.
//!
//! Steps: cache-first embedding, a `2K` vector query, a narrowed re-query
//! when one document dominates the results, score and language filtering,
//! and page resolution from the document store. Collaborator failures are
//! retried on a fixed backoff; persistent failure yields an empty result
//! marked `degraded`, never an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheKey, EmbeddingCache};
use crate::config::RetrievalConfig;
use crate::error::ProviderError;
use crate::metrics::PipelineMetrics;
use crate::providers::{
    DocumentStore, EmbeddingProvider, RetryPolicy, VectorBackend, VectorFilter, VectorHit,
    with_backoff,
};
use crate::tokens::TokenCounter;
use crate::types::{CorpusHandle, DocumentGroup, Language, Page, RankedChunks, RetrievedChunk};

/// Number of chunks to keep for a query of `tokens` tokens.
pub fn k_for_tokens(tokens: usize) -> usize {
    match tokens {
        0..20 => 3,
        20..50 => 6,
        50..100 => 10,
        _ => 15,
    }
}

pub struct RetrievalManager {
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorBackend>,
    documents: Arc<dyn DocumentStore>,
    cache: Arc<EmbeddingCache>,
    config: RetrievalConfig,
    retry: RetryPolicy,
    base_language: Language,
    tokens: TokenCounter,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl RetrievalManager {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorBackend>,
        documents: Arc<dyn DocumentStore>,
        cache: Arc<EmbeddingCache>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            vectors,
            documents,
            cache,
            retry: RetryPolicy::for_retrieval(&config),
            base_language: Language::from_code(&config.base_language),
            config,
            tokens: TokenCounter::cl100k(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// K for a query, from its `cl100k_base` token count.
    pub fn k_for(&self, query: &str) -> usize {
        k_for_tokens(self.tokens.count(query))
    }

    /// Run one collaborator call under the per-call timeout and retry policy.
    async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        with_backoff(&self.retry, label, |_| {
            let fut = op();
            async move {
                tokio::time::timeout(timeout, fut)
                    .await
                    .unwrap_or(Err(ProviderError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }))
            }
        })
        .await
    }

    /// Embed `text`, consulting the embedding cache first.
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>, ProviderError> {
        let key = CacheKey::for_embedding(text, self.embedder.name());
        if let Some(vector) = self.cache.get(&key) {
            return Ok(vector);
        }
        let vector = Arc::new(self.call("embed", || self.embedder.embed(text)).await?);
        self.cache.insert(key, Arc::clone(&vector));
        Ok(vector)
    }

    fn degraded(&self, stage: &str, error: &ProviderError) -> RankedChunks {
        warn!(stage, error = %error, "Retrieval degraded, continuing without documents");
        if let Some(m) = &self.metrics {
            m.record_degraded_retrieval();
        }
        RankedChunks::degraded()
    }

    pub async fn retrieve(
        &self,
        query: &str,
        corpus: &CorpusHandle,
        language: &Language,
        page_hint: Option<u32>,
    ) -> RankedChunks {
        let k = self.k_for(query);

        let vector = match self.embed(query).await {
            Ok(v) => v,
            Err(e) => return self.degraded("embed", &e),
        };

        let all = VectorFilter::default();
        let mut hits = match self
            .call("vector_query", || {
                self.vectors.query(&vector, 2 * k, &corpus.collection, &all)
            })
            .await
        {
            Ok(hits) => hits,
            Err(e) => return self.degraded("vector_query", &e),
        };

        let mut dominant_document = None;
        let initial = to_chunks(&hits);
        if let Some(top) = DocumentGroup::group(&initial).into_iter().next()
            && top.share_of(initial.len()) >= self.config.dominance_threshold
        {
            let filter = VectorFilter::document(top.document_id.clone());
            info!(
                document = %top.document_id,
                share = top.share_of(initial.len()),
                "Dominant document, narrowing search"
            );
            if let Some(m) = &self.metrics {
                m.record_dominant_requery();
            }
            match self
                .call("vector_requery", || {
                    self.vectors.query(&vector, 2 * k, &corpus.collection, &filter)
                })
                .await
            {
                Ok(narrowed) => {
                    hits = narrowed;
                    dominant_document = Some(top.document_id);
                }
                Err(e) => warn!(error = %e, "Narrowed re-query failed, keeping initial results"),
            }
        }

        let mut chunks: Vec<RetrievedChunk> = to_chunks(&hits)
            .into_iter()
            .filter(|c| c.score >= self.config.min_score)
            .filter(|c| c.language == *language || c.language == self.base_language)
            .collect();
        chunks.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut ranked = RankedChunks {
            chunks,
            k,
            dominant_document,
            ..Default::default()
        };
        if ranked.is_empty() {
            debug!(k, hits = hits.len(), "No chunks passed filtering");
            return ranked;
        }

        self.resolve_pages(&mut ranked).await;
        if let Some(page) = page_hint {
            pin_page(&mut ranked, page);
        }
        debug!(
            k,
            chunks = ranked.chunks.len(),
            documents = ranked.documents.len(),
            dominant = ?ranked.dominant_document,
            "Retrieval complete"
        );
        ranked
    }

    /// Fill `ranked.documents`. A store failure leaves documents unresolved
    /// but keeps the chunks.
    async fn resolve_pages(&self, ranked: &mut RankedChunks) {
        let ids = ranked.document_ids();
        match self
            .call("pages_by_doc_ids", || self.documents.pages_by_doc_ids(&ids))
            .await
        {
            Ok(pages) => ranked.documents = pages,
            Err(e) => {
                warn!(error = %e, "Document store unavailable, pages unresolved");
                return;
            }
        }
        for id in ids {
            if ranked.documents.get(&id).is_some_and(|p| !p.is_empty()) {
                continue;
            }
            match self.call("full_text", || self.documents.full_text(&id)).await {
                Ok(text) if !text.trim().is_empty() => {
                    ranked.documents.insert(id, vec![Page { number: 1, text }]);
                }
                Ok(_) => {}
                Err(e) => warn!(document = %id, error = %e, "Full text unavailable"),
            }
        }
    }
}

fn to_chunks(hits: &[VectorHit]) -> Vec<RetrievedChunk> {
    hits.iter()
        .map(|h| RetrievedChunk {
            text: h.text.clone(),
            document_id: h.metadata.document_id.clone(),
            page: h.metadata.page,
            score: (1.0 - h.distance).clamp(0.0, 1.0),
            language: h.metadata.language.clone(),
        })
        .collect()
}

/// Move the hinted page of the top document to the front, creating a chunk
/// from the page text when no retrieved chunk covers it.
fn pin_page(ranked: &mut RankedChunks, page: u32) {
    let Some(top_doc) = ranked.chunks.first().map(|c| c.document_id.clone()) else {
        return;
    };
    if let Some(pos) = ranked
        .chunks
        .iter()
        .position(|c| c.document_id == top_doc && c.page == page)
    {
        let chunk = ranked.chunks.remove(pos);
        ranked.chunks.insert(0, chunk);
        return;
    }
    let Some(text) = ranked
        .documents
        .get(&top_doc)
        .and_then(|pages| pages.iter().find(|p| p.number == page))
        .map(|p| p.text.clone())
    else {
        debug!(document = %top_doc, page, "Hinted page not found");
        return;
    };
    let score = ranked.chunks[0].score;
    let language = ranked.chunks[0].language.clone();
    ranked.chunks.insert(
        0,
        RetrievedChunk {
            text,
            document_id: top_doc,
            page,
            score,
            language,
        },
    );
}
