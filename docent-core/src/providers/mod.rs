//! External collaborator contracts and their adapters.
//!
//! The pipeline depends only on the traits defined here:
//! - [`CompletionProvider`]: chat completion, JSON classification, streaming
//! - [`EmbeddingProvider`]: text to vector
//! - [`VectorBackend`]: nearest-neighbour search over a collection
//! - [`DocumentStore`]: page-addressable document text
//! - [`ChatHistoryStore`]: append-only conversation turns
//!
//! Shipped adapters: an OpenAI-compatible HTTP provider, in-memory stores,
//! and a queue-based mock for tests.

pub mod failover;
pub mod memory;
pub mod mock;
pub mod openai_compat;
pub mod retry;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::types::{ChatTurn, DocumentId, Language, Page};

pub use failover::{CircuitBreaker, CircuitState};
pub use memory::{HashEmbedder, InMemoryChatHistory, InMemoryDocumentStore, InMemoryVectorBackend};
pub use mock::MockCompletionProvider;
pub use openai_compat::{OpenAiCompatibleProvider, OpenAiEmbedder};
pub use retry::{Backoff, RetryPolicy, with_backoff};

/// Generation parameters for one completion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1_024,
        }
    }
}

/// Events emitted during a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text fragment.
    Token(String),
    /// The stream finished normally.
    Done,
    /// The stream failed after it started.
    Error(String),
}

/// A text-completion model.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name reported in answers and logs.
    fn name(&self) -> &str;

    /// Return the context window size for this provider/model.
    fn context_window(&self) -> usize {
        128_000
    }

    /// Perform a full completion and return the generated text.
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// Ask for a JSON object and return it parsed.
    ///
    /// The default implementation runs a plain completion and extracts the
    /// first `{ ... }` span from the reply.
    async fn classify(&self, prompt: &str) -> Result<serde_json::Value, ProviderError> {
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 256,
        };
        let reply = self.complete(prompt, &options).await?;
        extract_json_object(&reply)
    }

    /// Perform a streaming completion, sending events to the channel.
    ///
    /// Implementations stop producing once `tx` is closed. The default
    /// implementation sends the whole completion as a single token.
    async fn complete_streaming(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let text = self.complete(prompt, options).await?;
        if tx.send(StreamEvent::Token(text)).await.is_ok() {
            let _ = tx.send(StreamEvent::Done).await;
        }
        Ok(())
    }
}

/// Pull the outermost JSON object out of a model reply that may wrap it in
/// prose or code fences.
pub fn extract_json_object(reply: &str) -> Result<serde_json::Value, ProviderError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => {
            serde_json::from_str(&reply[s..=e]).map_err(|e| ProviderError::ResponseParse {
                message: format!("invalid JSON object: {e}"),
            })
        }
        _ => Err(ProviderError::ResponseParse {
            message: "no JSON object in reply".to_string(),
        }),
    }
}

/// Text to embedding vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Name that participates in embedding cache keys.
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: DocumentId,
    pub page: u32,
    pub language: Language,
}

/// One nearest-neighbour result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Cosine distance in `[0, 2]`; smaller is closer.
    pub distance: f32,
}

/// Restriction applied to a vector query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorFilter {
    pub document_id: Option<DocumentId>,
}

impl VectorFilter {
    pub fn document(id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: Some(id.into()),
        }
    }
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, ProviderError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Pages for each requested document, in page order. Unknown ids are omitted.
    async fn pages_by_doc_ids(
        &self,
        ids: &[DocumentId],
    ) -> Result<HashMap<DocumentId, Vec<Page>>, ProviderError>;

    async fn full_text(&self, id: &DocumentId) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    async fn append(&self, conversation_id: &str, turn: ChatTurn) -> Result<(), ProviderError>;

    /// The last `n` turns, oldest first.
    async fn recent(&self, conversation_id: &str, n: usize)
    -> Result<Vec<ChatTurn>, ProviderError>;
}
