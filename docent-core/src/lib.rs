//! # Docent Core
//!
//! Query orchestration for grounded question answering over document corpora.
//! A query passes the gate ([`classifier`]), is matched against the corpus
//! ([`retrieval`]), gets a context plan sized to the model's window
//! ([`strategy`]), and is answered through a cached, retried, circuit-broken
//! model call ([`orchestrator`]) before clean-up ([`postprocess`]).
//! [`pipeline`] wires the stages together.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod locale;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod postprocess;
pub mod prompt;
pub mod providers;
pub mod retrieval;
pub mod strategy;
pub mod tokens;
pub mod translation;
pub mod types;

// Re-export commonly used types at the crate root.
pub use cache::{CacheKey, CacheTier, CachedAnswer, EmbeddingCache, ResponseCache, TtlCache};
pub use classifier::{ClassificationDecision, ClassificationOutcome, InvalidReason, QueryClassifier};
pub use config::{DocentConfig, TranslationConfig, load_config};
pub use error::{ConfigError, DocentError, ErrorClass, ProviderError, Result, TranslationError};
pub use locale::Message;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{ModelAttempt, ModelOrchestrator};
pub use pipeline::{QueryPipeline, QueryPipelineBuilder, QueryRequest};
pub use postprocess::{PostProcessed, postprocess};
pub use providers::{
    ChatHistoryStore, CompletionOptions, CompletionProvider, DocumentStore, EmbeddingProvider,
    StreamEvent, VectorBackend,
};
pub use retrieval::RetrievalManager;
pub use strategy::{ContextPlan, ContextStrategySelector, TokenBudget};
pub use tokens::TokenCounter;
pub use translation::{
    GlossaryLock, GlossaryTranslator, ProcessTranslator, SerializedTranslator, TranslationEvent,
    TranslationService,
};
pub use types::{
    Answer, AnswerState, ChatTurn, Citation, ContextBundle, CorpusHandle, GateReason, Language,
    Query, RankedChunks, Role, StrategyKind,
};
