//! The query pipeline: gate, retrieval, context strategy, model, clean-up.
//!
//! Steps run in order for each query. Only the sub-questions of an agentic
//! decomposition run concurrently, and they are joined before synthesis.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{EmbeddingCache, ResponseCache};
use crate::classifier::{ClassificationOutcome, InvalidReason, QueryClassifier};
use crate::config::DocentConfig;
use crate::error::ConfigError;
use crate::locale::Message;
use crate::metrics::PipelineMetrics;
use crate::orchestrator::{ModelOrchestrator, STATIC_PROVIDER};
use crate::postprocess::postprocess;
use crate::prompt::{self, NOT_FOUND_SENTENCE};
use crate::providers::{
    ChatHistoryStore, CompletionProvider, DocumentStore, EmbeddingProvider, InMemoryChatHistory,
    StreamEvent, VectorBackend,
};
use crate::retrieval::RetrievalManager;
use crate::strategy::{ContextPlan, ContextStrategySelector};
use crate::types::{
    Answer, AnswerState, ChatTurn, ContextBundle, CorpusHandle, CorpusStats, GateReason,
    Language, ModelAnswer, Query, SubAnswer,
};

/// One user question against one corpus.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub conversation_id: String,
    /// Overrides script-based language detection.
    pub language: Option<Language>,
    pub corpus: CorpusHandle,
}

impl QueryRequest {
    pub fn new(
        text: impl Into<String>,
        conversation_id: impl Into<String>,
        corpus: CorpusHandle,
    ) -> Self {
        Self {
            text: text.into(),
            conversation_id: conversation_id.into(),
            language: None,
            corpus,
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }
}

/// Result of everything before the answering model call.
enum Plan {
    Fixed(Answer),
    Model {
        bundle: ContextBundle,
        state: AnswerState,
        sub_queries: Vec<String>,
    },
}

pub struct QueryPipeline {
    classifier: QueryClassifier,
    retrieval: RetrievalManager,
    strategy: ContextStrategySelector,
    orchestrator: ModelOrchestrator,
    history: Arc<dyn ChatHistoryStore>,
    history_window: usize,
    metrics: Arc<PipelineMetrics>,
}

/// Assembles a [`QueryPipeline`] from its collaborators.
pub struct QueryPipelineBuilder {
    config: DocentConfig,
    primary: Option<Arc<dyn CompletionProvider>>,
    fallback: Option<Arc<dyn CompletionProvider>>,
    classifier_model: Option<Arc<dyn CompletionProvider>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    vectors: Option<Arc<dyn VectorBackend>>,
    documents: Option<Arc<dyn DocumentStore>>,
    history: Option<Arc<dyn ChatHistoryStore>>,
    embedding_cache: Option<Arc<EmbeddingCache>>,
    answer_cache: Option<Arc<ResponseCache>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl QueryPipelineBuilder {
    pub fn primary(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.primary = Some(provider);
        self
    }

    pub fn fallback(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    /// Fast model used by the gate. Without one the gate is heuristic only.
    pub fn classifier_model(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.classifier_model = Some(provider);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vectors(mut self, vectors: Arc<dyn VectorBackend>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn history(mut self, history: Arc<dyn ChatHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn embedding_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.embedding_cache = Some(cache);
        self
    }

    pub fn answer_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.answer_cache = Some(cache);
        self
    }

    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<QueryPipeline, ConfigError> {
        self.config.validate()?;
        let missing = |what: &str| ConfigError::Invalid {
            message: format!("query pipeline needs {what}"),
        };
        let primary = self.primary.ok_or_else(|| missing("a primary completion provider"))?;
        let embedder = self.embedder.ok_or_else(|| missing("an embedding provider"))?;
        let vectors = self.vectors.ok_or_else(|| missing("a vector backend"))?;
        let documents = self.documents.ok_or_else(|| missing("a document store"))?;

        let config = self.config;
        let metrics = self.metrics.unwrap_or_default();
        let embedding_cache = self
            .embedding_cache
            .unwrap_or_else(|| Arc::new(EmbeddingCache::embeddings(&config.cache)));
        let answer_cache = self
            .answer_cache
            .unwrap_or_else(|| Arc::new(ResponseCache::answers(&config.cache)));

        let mut classifier = QueryClassifier::new(config.classifier.clone());
        if let Some(model) = self.classifier_model {
            classifier = classifier.with_model(model);
        }

        let retrieval = RetrievalManager::new(
            embedder,
            vectors,
            documents,
            embedding_cache,
            config.retrieval.clone(),
        )
        .with_metrics(Arc::clone(&metrics));

        let strategy = ContextStrategySelector::new(
            config.strategy.clone(),
            config.history.window,
            primary.context_window(),
        );

        let mut orchestrator = ModelOrchestrator::new(primary, answer_cache, &config.orchestrator)
            .with_metrics(Arc::clone(&metrics));
        if let Some(fallback) = self.fallback {
            orchestrator = orchestrator.with_fallback(fallback);
        }

        Ok(QueryPipeline {
            classifier,
            retrieval,
            strategy,
            orchestrator,
            history: self
                .history
                .unwrap_or_else(|| Arc::new(InMemoryChatHistory::new())),
            history_window: config.history.window,
            metrics,
        })
    }
}

impl QueryPipeline {
    pub fn builder(config: DocentConfig) -> QueryPipelineBuilder {
        QueryPipelineBuilder {
            config,
            primary: None,
            fallback: None,
            classifier_model: None,
            embedder: None,
            vectors: None,
            documents: None,
            history: None,
            embedding_cache: None,
            answer_cache: None,
            metrics: None,
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn orchestrator(&self) -> &ModelOrchestrator {
        &self.orchestrator
    }

    /// Answer a question. Never fails; every failure degrades to a weaker answer.
    pub async fn ask(&self, request: &QueryRequest) -> Answer {
        let (query, history) = self.begin(request).await;
        match self.plan(&query, &history, &request.corpus).await {
            Plan::Fixed(answer) => self.conclude(&query, answer).await,
            Plan::Model {
                bundle,
                state,
                sub_queries,
            } => {
                let model = self
                    .orchestrator
                    .answer(&bundle, &history, query.language())
                    .await;
                let answer = self.assemble(&query, &bundle, state, sub_queries, model);
                self.conclude(&query, answer).await
            }
        }
    }

    /// Answer a question, streaming the answer text to `tx` as it is produced.
    ///
    /// Streamed tokens are the raw model output; the returned [`Answer`]
    /// carries the cleaned text.
    pub async fn ask_streaming(
        &self,
        request: &QueryRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Answer {
        let (query, history) = self.begin(request).await;
        match self.plan(&query, &history, &request.corpus).await {
            Plan::Fixed(answer) => {
                if tx.send(StreamEvent::Token(answer.text.clone())).await.is_ok() {
                    let _ = tx.send(StreamEvent::Done).await;
                }
                self.conclude(&query, answer).await
            }
            Plan::Model {
                bundle,
                state,
                sub_queries,
            } => {
                let model = self
                    .orchestrator
                    .answer_streaming(&bundle, &history, query.language(), tx)
                    .await;
                let answer = self.assemble(&query, &bundle, state, sub_queries, model);
                self.conclude(&query, answer).await
            }
        }
    }

    async fn begin(&self, request: &QueryRequest) -> (Query, Vec<ChatTurn>) {
        self.metrics.record_query();
        let mut query = Query::new(&request.text, &request.conversation_id);
        if let Some(language) = &request.language {
            query = query.with_language(language.clone());
        }
        debug!(
            query_id = %query.id(),
            chars = query.char_len(),
            language = %query.language(),
            "Query received"
        );
        let history = match self
            .history
            .recent(query.conversation_id(), self.history_window)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "Chat history unavailable, continuing without it");
                Vec::new()
            }
        };
        (query, history)
    }

    async fn plan(&self, query: &Query, history: &[ChatTurn], corpus: &CorpusHandle) -> Plan {
        let language = query.language();
        let decision = match self.classifier.classify(query, history).await {
            ClassificationOutcome::Invalid { reason } => {
                self.metrics.record_invalid();
                let message = match reason {
                    InvalidReason::TooShort => Message::TooShort,
                    InvalidReason::TooLong => Message::TooLong,
                };
                return Plan::Fixed(Answer::fixed(
                    message.text(language),
                    AnswerState::Invalid,
                    language.clone(),
                ));
            }
            ClassificationOutcome::Decided(decision) => decision,
        };

        if let Some(reason) = decision.gate_reason() {
            self.metrics.record_short_circuit();
            let state = AnswerState::ShortCircuited { reason };
            let message = match reason {
                GateReason::ChatHistory => {
                    return Plan::Model {
                        bundle: self
                            .strategy
                            .build_history_only(query.text(), history, language),
                        state,
                        sub_queries: Vec::new(),
                    };
                }
                GateReason::Greeting => Message::Greeting,
                GateReason::Abusive => Message::Abusive,
                GateReason::Gibberish => Message::Gibberish,
            };
            return Plan::Fixed(Answer::fixed(message.text(language), state, language.clone()));
        }

        let ranked = self
            .retrieval
            .retrieve(query.text(), corpus, language, decision.page_number)
            .await;
        if ranked.is_empty() {
            if ranked.degraded {
                return Plan::Model {
                    bundle: self.strategy.build_minimal(query.text(), history, language),
                    state: AnswerState::Degraded,
                    sub_queries: Vec::new(),
                };
            }
            self.metrics.record_not_found();
            return Plan::Fixed(Answer::fixed(
                Message::NotFound.text(language),
                AnswerState::NotFoundInCorpus,
                language.clone(),
            ));
        }

        let stats = CorpusStats::from_ranked(&ranked);
        match self
            .strategy
            .select_and_build(query.text(), &ranked, &stats, history, language)
        {
            ContextPlan::Ready(bundle) => Plan::Model {
                bundle,
                state: AnswerState::Answered,
                sub_queries: Vec::new(),
            },
            ContextPlan::Decompose { sub_queries } => {
                let answers = join_all(
                    sub_queries
                        .iter()
                        .map(|sub| self.answer_sub_query(query.text(), sub, corpus, language)),
                )
                .await;
                Plan::Model {
                    bundle: self
                        .strategy
                        .build_synthesis(query.text(), &answers, history, language),
                    state: AnswerState::Answered,
                    sub_queries,
                }
            }
        }
    }

    async fn answer_sub_query(
        &self,
        original: &str,
        sub_query: &str,
        corpus: &CorpusHandle,
        language: &Language,
    ) -> SubAnswer {
        let ranked = self.retrieval.retrieve(sub_query, corpus, language, None).await;
        if ranked.is_empty() {
            debug!(sub_query, "No evidence for sub-question");
            return SubAnswer {
                question: sub_query.to_string(),
                answer: NOT_FOUND_SENTENCE.to_string(),
                citations: Vec::new(),
            };
        }
        let stats = CorpusStats::from_ranked(&ranked);
        let question = prompt::sub_question_text(original, sub_query);
        let bundle = self
            .strategy
            .build_focused(&question, &ranked, &stats, &[], language);
        let model = self.orchestrator.answer(&bundle, &[], language).await;
        let cleaned = postprocess(&model.text, bundle.citations);
        SubAnswer {
            question: sub_query.to_string(),
            answer: cleaned.text,
            citations: cleaned.citations,
        }
    }

    fn assemble(
        &self,
        query: &Query,
        bundle: &ContextBundle,
        state: AnswerState,
        sub_queries: Vec<String>,
        model: ModelAnswer,
    ) -> Answer {
        let cleaned = postprocess(&model.text, bundle.citations.clone());
        let state = if model.provider_used == STATIC_PROVIDER {
            AnswerState::Degraded
        } else if cleaned.not_found && state == AnswerState::Answered {
            self.metrics.record_not_found();
            AnswerState::NotFoundInCorpus
        } else {
            state
        };
        Answer {
            text: cleaned.text,
            citations: cleaned.citations,
            state,
            strategy: Some(bundle.strategy),
            provider_used: Some(model.provider_used),
            cached: model.cached,
            duration_ms: model.duration_ms,
            language: query.language().clone(),
            sub_queries,
        }
    }

    /// Record the exchange and log a summary.
    async fn conclude(&self, query: &Query, answer: Answer) -> Answer {
        if answer.state != AnswerState::Invalid {
            let turns = [ChatTurn::user(query.text()), ChatTurn::assistant(&answer.text)];
            for turn in turns {
                if let Err(e) = self.history.append(query.conversation_id(), turn).await {
                    warn!(error = %e, "Failed to record chat turn");
                    break;
                }
            }
        }
        info!(
            query_id = %query.id(),
            conversation = query.conversation_id(),
            language = %query.language(),
            state = ?answer.state,
            strategy = ?answer.strategy,
            provider = answer.provider_used.as_deref().unwrap_or("none"),
            cached = answer.cached,
            citations = answer.citations.len(),
            sub_queries = answer.sub_queries.len(),
            "Query answered"
        );
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        HashEmbedder, InMemoryDocumentStore, InMemoryVectorBackend, MockCompletionProvider,
    };

    fn pipeline(primary: Arc<MockCompletionProvider>) -> QueryPipeline {
        QueryPipeline::builder(DocentConfig::default())
            .primary(primary)
            .embedder(Arc::new(HashEmbedder::new(64)))
            .vectors(Arc::new(InMemoryVectorBackend::new()))
            .documents(Arc::new(InMemoryDocumentStore::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_primary() {
        let result = QueryPipeline::builder(DocentConfig::default())
            .embedder(Arc::new(HashEmbedder::new(64)))
            .vectors(Arc::new(InMemoryVectorBackend::new()))
            .documents(Arc::new(InMemoryDocumentStore::new()))
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_empty_corpus_is_not_found() {
        let primary = Arc::new(MockCompletionProvider::with_response("primary", "unused"));
        let p = pipeline(primary.clone());
        let request = QueryRequest::new("What is osmosis?", "c1", CorpusHandle::new("empty"));
        let answer = p.ask(&request).await;
        assert_eq!(answer.state, AnswerState::NotFoundInCorpus);
        assert_eq!(answer.text, Message::NotFound.text(&Language::English));
        assert_eq!(primary.call_count(), 0);
        assert_eq!(p.metrics().snapshot().not_found, 1);
    }

    #[tokio::test]
    async fn test_invalid_query_is_not_recorded_in_history() {
        let primary = Arc::new(MockCompletionProvider::new("primary"));
        let history = Arc::new(InMemoryChatHistory::new());
        let p = QueryPipeline::builder(DocentConfig::default())
            .primary(primary)
            .embedder(Arc::new(HashEmbedder::new(64)))
            .vectors(Arc::new(InMemoryVectorBackend::new()))
            .documents(Arc::new(InMemoryDocumentStore::new()))
            .history(history.clone())
            .build()
            .unwrap();
        let answer = p
            .ask(&QueryRequest::new("?", "c1", CorpusHandle::new("docs")))
            .await;
        assert_eq!(answer.state, AnswerState::Invalid);
        assert!(history.recent("c1", 10).await.unwrap().is_empty());

        p.ask(&QueryRequest::new("hello", "c1", CorpusHandle::new("docs")))
            .await;
        assert_eq!(history.recent("c1", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_streaming_fixed_answer() {
        let p = pipeline(Arc::new(MockCompletionProvider::new("primary")));
        let (tx, mut rx) = mpsc::channel(4);
        let request = QueryRequest::new("namaste", "c1", CorpusHandle::new("docs"));
        let answer = p.ask_streaming(&request, tx).await;
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Token(answer.text.clone()))
        );
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));
    }
}
