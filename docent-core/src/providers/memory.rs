//! In-memory collaborators: a hashing embedder, a brute-force vector index,
//! a page store, and chat history. Used by the CLI for local corpora and by
//! tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use super::{
    ChatHistoryStore, ChunkMetadata, DocumentStore, EmbeddingProvider, VectorBackend,
    VectorFilter, VectorHit,
};
use crate::error::ProviderError;
use crate::types::{ChatTurn, DocumentId, Language, Page};

/// Page separator in plain-text corpora.
pub const PAGE_BREAK: char = '\u{c}';

/// Chunks are packed up to roughly this many characters.
const CHUNK_CHARS: usize = 800;

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Term-frequency embedder that hashes words into a fixed number of buckets.
///
/// Deterministic and offline. Quality is far below a learned model but
/// enough for lexical overlap.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    name: String,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            name: format!("hash-{dimensions}"),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            vector[djb2(term) % self.dimensions] += *count as f32;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

fn djb2(s: &str) -> usize {
    s.bytes()
        .fold(5381usize, |h, b| h.wrapping_mul(33).wrapping_add(b as usize))
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_sync(text))
    }
}

/// Cosine similarity; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ---------------------------------------------------------------------------
// Vector backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct IndexedChunk {
    vector: Vec<f32>,
    text: String,
    metadata: ChunkMetadata,
}

/// Brute-force cosine index, partitioned by collection.
#[derive(Default)]
pub struct InMemoryVectorBackend {
    collections: RwLock<HashMap<String, Vec<IndexedChunk>>>,
    queries: Mutex<Vec<VectorFilter>>,
    query_count: AtomicUsize,
}

impl InMemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        collection: &str,
        vector: Vec<f32>,
        text: impl Into<String>,
        metadata: ChunkMetadata,
    ) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(IndexedChunk {
                vector,
                text: text.into(),
                metadata,
            });
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }

    /// Number of queries served so far.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Filters of every query served so far, in order.
    pub fn query_filters(&self) -> Vec<VectorFilter> {
        self.queries
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorBackend {
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, ProviderError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.queries.lock() {
            log.push(filter.clone());
        }
        let collections = self.collections.read().await;
        let Some(chunks) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<VectorHit> = chunks
            .iter()
            .filter(|c| {
                filter
                    .document_id
                    .as_ref()
                    .is_none_or(|id| *id == c.metadata.document_id)
            })
            .map(|c| VectorHit {
                text: c.text.clone(),
                metadata: c.metadata.clone(),
                distance: 1.0 - cosine_similarity(vector, &c.vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Page store keyed by document id.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, Vec<Page>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pages(&self, id: impl Into<DocumentId>, pages: Vec<Page>) {
        self.documents.write().await.insert(id.into(), pages);
    }

    /// Insert plain text, splitting pages on form feeds. Returns the pages.
    pub async fn insert_text(&self, id: impl Into<DocumentId>, text: &str) -> Vec<Page> {
        let pages = split_pages(text);
        self.insert_pages(id, pages.clone()).await;
        pages
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

/// Split on form feeds into 1-based pages, dropping blank pages but keeping
/// numbering.
pub fn split_pages(text: &str) -> Vec<Page> {
    text.split(PAGE_BREAK)
        .enumerate()
        .filter(|(_, t)| !t.trim().is_empty())
        .map(|(i, t)| Page {
            number: i as u32 + 1,
            text: t.trim().to_string(),
        })
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn pages_by_doc_ids(
        &self,
        ids: &[DocumentId],
    ) -> Result<HashMap<DocumentId, Vec<Page>>, ProviderError> {
        let documents = self.documents.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| documents.get(id).map(|pages| (id.clone(), pages.clone())))
            .collect())
    }

    async fn full_text(&self, id: &DocumentId) -> Result<String, ProviderError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(id)
            .map(|pages| {
                pages
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Chat history
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryChatHistory {
    conversations: RwLock<HashMap<String, Vec<ChatTurn>>>,
}

impl InMemoryChatHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatHistoryStore for InMemoryChatHistory {
    async fn append(&self, conversation_id: &str, turn: ChatTurn) -> Result<(), ProviderError> {
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn recent(
        &self,
        conversation_id: &str,
        n: usize,
    ) -> Result<Vec<ChatTurn>, ProviderError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|turns| turns[turns.len().saturating_sub(n)..].to_vec())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Corpus loading
// ---------------------------------------------------------------------------

/// Pack a page's paragraphs into chunks of about [`CHUNK_CHARS`] characters.
pub fn chunk_page(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.chars().count() + para.chars().count() > CHUNK_CHARS {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Index one document: store its pages and embed each chunk.
pub async fn index_document(
    id: &str,
    text: &str,
    collection: &str,
    embedder: &dyn EmbeddingProvider,
    vectors: &InMemoryVectorBackend,
    store: &InMemoryDocumentStore,
) -> Result<usize, ProviderError> {
    let pages = store.insert_text(id, text).await;
    let mut indexed = 0;
    for page in &pages {
        let language = Language::detect(&page.text);
        for chunk in chunk_page(&page.text) {
            let vector = embedder.embed(&chunk).await?;
            let metadata = ChunkMetadata {
                document_id: id.to_string(),
                page: page.number,
                language: language.clone(),
            };
            vectors.insert(collection, vector, chunk, metadata).await;
            indexed += 1;
        }
    }
    Ok(indexed)
}

/// Summary of a directory load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusLoad {
    pub documents: usize,
    pub chunks: usize,
}

/// Load every `.txt` and `.md` file under `dir`. The file stem becomes the
/// document id.
pub async fn index_directory(
    dir: &Path,
    collection: &str,
    embedder: &dyn EmbeddingProvider,
    vectors: &InMemoryVectorBackend,
    store: &InMemoryDocumentStore,
) -> crate::error::Result<CorpusLoad> {
    let mut load = CorpusLoad::default();
    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "txt" | "md"));
        if !is_text {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = tokio::fs::read_to_string(path).await?;
        let chunks = index_document(id, &text, collection, embedder, vectors, store).await?;
        tracing::debug!(document = id, chunks, "Indexed document");
        load.documents += 1;
        load.chunks += chunks;
    }
    Ok(load)
}
