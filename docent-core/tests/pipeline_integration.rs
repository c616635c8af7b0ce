//! End-to-end tests for the query pipeline over in-memory collaborators.
//!
//! Every chunk and every query embeds to the same vector, so retrieval order
//! is insertion order and scores are 1.0.

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use docent_core::config::DocentConfig;
use docent_core::error::ProviderError;
use docent_core::providers::{
    ChunkMetadata, EmbeddingProvider, InMemoryDocumentStore, InMemoryVectorBackend,
    MockCompletionProvider, StreamEvent, VectorFilter,
};
use docent_core::types::{
    AnswerState, CorpusHandle, GateReason, Language, Page, StrategyKind,
};
use docent_core::{Message, QueryPipeline, QueryRequest};

const COLLECTION: &str = "course";

struct FixedEmbedder;

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![1.0, 0.0])
    }
}

struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    fn name(&self) -> &str {
        "down"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::ServerError {
            status: 503,
            message: "embedding service unavailable".into(),
        })
    }
}

struct Corpus {
    vectors: Arc<InMemoryVectorBackend>,
    documents: Arc<InMemoryDocumentStore>,
}

/// One chunk per page, documents inserted in the given order.
async fn corpus(docs: &[(&str, u32)]) -> Corpus {
    let vectors = Arc::new(InMemoryVectorBackend::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    for (id, pages) in docs {
        let pages: Vec<Page> = (1..=*pages)
            .map(|number| Page {
                number,
                text: format!("{id} page {number}: osmosis moves water across membranes."),
            })
            .collect();
        for page in &pages {
            vectors
                .insert(
                    COLLECTION,
                    vec![1.0, 0.0],
                    page.text.clone(),
                    ChunkMetadata {
                        document_id: id.to_string(),
                        page: page.number,
                        language: Language::English,
                    },
                )
                .await;
        }
        documents.insert_pages(*id, pages).await;
    }
    Corpus { vectors, documents }
}

fn pipeline(corpus: &Corpus, primary: Arc<MockCompletionProvider>) -> QueryPipeline {
    QueryPipeline::builder(DocentConfig::default())
        .primary(primary)
        .embedder(Arc::new(FixedEmbedder))
        .vectors(corpus.vectors.clone())
        .documents(corpus.documents.clone())
        .build()
        .unwrap()
}

fn request(text: &str, conversation: &str) -> QueryRequest {
    QueryRequest::new(text, conversation, CorpusHandle::new(COLLECTION))
}

#[tokio::test]
async fn test_greeting_short_circuits_without_retrieval_or_model() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response("primary", "unused"));
    let p = pipeline(&corpus, primary.clone());

    let answer = p.ask(&request("hi", "c1")).await;

    assert_eq!(
        answer.state,
        AnswerState::ShortCircuited {
            reason: GateReason::Greeting
        }
    );
    assert_eq!(answer.text, Message::Greeting.text(&Language::English));
    assert_eq!(corpus.vectors.query_count(), 0);
    assert_eq!(primary.call_count(), 0);
    assert_eq!(p.metrics().snapshot().short_circuits, 1);
}

#[tokio::test]
async fn test_invalid_query_makes_no_calls() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response("primary", "unused"));
    let p = pipeline(&corpus, primary.clone());

    let answer = p.ask(&request(&"osmosis ".repeat(400), "c1")).await;

    assert_eq!(answer.state, AnswerState::Invalid);
    assert_eq!(answer.text, Message::TooLong.text(&Language::English));
    assert_eq!(corpus.vectors.query_count(), 0);
    assert_eq!(primary.call_count(), 0);
}

#[tokio::test]
async fn test_small_corpus_is_sent_whole() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Osmosis moves water across membranes (bio, Page 2).",
    ));
    let p = pipeline(&corpus, primary.clone());

    let answer = p.ask(&request("What is osmosis?", "c1")).await;

    assert_eq!(answer.state, AnswerState::Answered);
    assert_eq!(answer.strategy, Some(StrategyKind::FullDocument));
    assert_eq!(answer.provider_used.as_deref(), Some("primary"));
    assert!(!answer.citations.is_empty());
    assert!(answer.citations.iter().all(|c| c.document_id == "bio"));

    let prompt = &primary.prompts()[0];
    for page in 1..=3 {
        assert!(prompt.contains(&format!("bio page {page}:")), "page {page} missing");
    }
}

#[tokio::test]
async fn test_complex_query_over_large_corpus_is_decomposed() {
    let corpus = corpus(&[("history", 300)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Chapter 1 covers the causes and chapter 3 the outcomes (history, Page 2).",
    ));
    let p = pipeline(&corpus, primary.clone());

    let answer = p.ask(&request("Compare chapter 1 and chapter 3", "c1")).await;

    assert_eq!(answer.state, AnswerState::Answered);
    assert_eq!(answer.strategy, Some(StrategyKind::AgenticDecomposition));
    assert!(answer.sub_queries.len() >= 2);
    assert!(answer.sub_queries.len() <= 4);

    // One call per sub-question plus the synthesis.
    let prompts = primary.prompts();
    assert_eq!(prompts.len(), answer.sub_queries.len() + 1);
    let sub_prompts = prompts
        .iter()
        .filter(|p| p.contains("part of the larger question: Compare chapter 1 and chapter 3"))
        .count();
    assert_eq!(sub_prompts, answer.sub_queries.len());
    assert!(prompts.iter().any(|p| p.contains("Findings:")));
    assert!(!answer.citations.is_empty());
}

#[tokio::test]
async fn test_dominant_document_triggers_narrowed_requery() {
    let corpus = corpus(&[("bio", 10), ("chem", 1)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Osmosis moves water (bio, Page 1).",
    ));
    let p = pipeline(&corpus, primary);

    p.ask(&request("What is osmosis?", "c1")).await;

    assert_eq!(
        corpus.vectors.query_filters(),
        vec![VectorFilter::default(), VectorFilter::document("bio")]
    );
    assert_eq!(p.metrics().snapshot().dominant_requeries, 1);
}

#[tokio::test]
async fn test_repeated_question_is_served_from_cache() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Osmosis moves water (bio, Page 1).",
    ));
    let p = pipeline(&corpus, primary.clone());

    // Separate conversations so both see the same (empty) history.
    let first = p.ask(&request("What is osmosis?", "c1")).await;
    let second = p.ask(&request("What is osmosis?", "c2")).await;

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.duration_ms, 0);
    assert_eq!(first.text, second.text);
    assert_eq!(first.citations, second.citations);
    assert_eq!(primary.call_count(), 1);
    assert_eq!(p.metrics().snapshot().cache_hits, 1);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::failing(
        "primary",
        ProviderError::from_status("primary", 401, "invalid api key"),
    ));
    let fallback = Arc::new(MockCompletionProvider::with_response(
        "fallback",
        "Osmosis moves water (bio, Page 1).",
    ));
    let p = QueryPipeline::builder(DocentConfig::default())
        .primary(primary.clone())
        .fallback(fallback.clone())
        .embedder(Arc::new(FixedEmbedder))
        .vectors(corpus.vectors.clone())
        .documents(corpus.documents.clone())
        .build()
        .unwrap();

    let answer = p.ask(&request("What is osmosis?", "c1")).await;

    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
    assert_eq!(answer.provider_used.as_deref(), Some("fallback"));
    assert_eq!(answer.state, AnswerState::Answered);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_repeated_primary_failures() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::failing(
        "primary",
        ProviderError::from_status("primary", 401, "invalid api key"),
    ));
    let fallback = Arc::new(MockCompletionProvider::with_response(
        "fallback",
        "Osmosis moves water (bio, Page 1).",
    ));
    let p = QueryPipeline::builder(DocentConfig::default())
        .primary(primary.clone())
        .fallback(fallback.clone())
        .embedder(Arc::new(FixedEmbedder))
        .vectors(corpus.vectors.clone())
        .documents(corpus.documents.clone())
        .build()
        .unwrap();

    for i in 0..6 {
        let answer = p
            .ask(&request(&format!("What is osmosis, part {i}?"), &format!("c{i}")))
            .await;
        assert_eq!(answer.provider_used.as_deref(), Some("fallback"));
    }

    // The sixth query skipped the open breaker.
    assert_eq!(primary.call_count(), 5);
    assert_eq!(fallback.call_count(), 6);
    assert!(p.orchestrator().breaker().lock().await.is_open());
    assert_eq!(p.metrics().snapshot().breaker_trips, 1);
}

#[tokio::test]
async fn test_every_model_failing_degrades_to_apology() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::failing(
        "primary",
        ProviderError::from_status("primary", 403, "forbidden"),
    ));
    let p = pipeline(&corpus, primary);

    let answer = p
        .ask(&request("What is osmosis?", "c1").with_language(Language::Hindi))
        .await;

    assert_eq!(answer.state, AnswerState::Degraded);
    assert_eq!(answer.text, Message::Apology.text(&Language::Hindi));
    assert_eq!(answer.provider_used.as_deref(), Some("static"));
    assert!(!answer.cached);
}

#[tokio::test(start_paused = true)]
async fn test_retrieval_outage_answers_without_documents() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Osmosis is the movement of water across a membrane.",
    ));
    let p = QueryPipeline::builder(DocentConfig::default())
        .primary(primary.clone())
        .embedder(Arc::new(DownEmbedder))
        .vectors(corpus.vectors.clone())
        .documents(corpus.documents.clone())
        .build()
        .unwrap();

    let answer = p.ask(&request("What is osmosis?", "c1")).await;

    assert_eq!(answer.state, AnswerState::Degraded);
    assert_eq!(answer.strategy, Some(StrategyKind::Minimal));
    assert!(answer.citations.is_empty());
    assert_eq!(corpus.vectors.query_count(), 0);
    assert_eq!(primary.call_count(), 1);
    assert_eq!(p.metrics().snapshot().degraded_retrievals, 1);
}

#[tokio::test]
async fn test_model_not_found_reply_drops_citations() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Let me search the documents. The answer was not found in the document.",
    ));
    let p = pipeline(&corpus, primary);

    let answer = p.ask(&request("Who won the 1998 world cup?", "c1")).await;

    assert_eq!(answer.state, AnswerState::NotFoundInCorpus);
    assert_eq!(answer.text, "The answer was not found in the document.");
    assert!(answer.citations.is_empty());
}

#[tokio::test]
async fn test_follow_up_about_conversation_uses_history_only() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Osmosis moves water (bio, Page 1).",
    ));
    let p = pipeline(&corpus, primary.clone());

    p.ask(&request("What is osmosis?", "c1")).await;
    let queries_before = corpus.vectors.query_count();
    primary.queue_response("You asked what osmosis is.");

    let answer = p.ask(&request("What did I just ask?", "c1")).await;

    assert_eq!(
        answer.state,
        AnswerState::ShortCircuited {
            reason: GateReason::ChatHistory
        }
    );
    assert_eq!(answer.strategy, Some(StrategyKind::HistoryOnly));
    assert_eq!(answer.text, "You asked what osmosis is.");
    assert_eq!(corpus.vectors.query_count(), queries_before);
    let prompt = primary.prompts().pop().unwrap();
    assert!(prompt.contains("User: What is osmosis?"));
}

#[tokio::test]
async fn test_classifier_disagreement_proceeds_to_retrieval() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "Osmosis moves water (bio, Page 1).",
    ));
    let classifier = Arc::new(MockCompletionProvider::new("fast"));
    classifier.queue_classification(serde_json::json!({
        "is_greeting": true,
        "needs_documents": false
    }));
    let p = QueryPipeline::builder(DocentConfig::default())
        .primary(primary.clone())
        .classifier_model(classifier.clone())
        .embedder(Arc::new(FixedEmbedder))
        .vectors(corpus.vectors.clone())
        .documents(corpus.documents.clone())
        .build()
        .unwrap();

    let answer = p.ask(&request("Hello, what is osmosis?", "c1")).await;

    assert_eq!(classifier.classify_count(), 1);
    assert_eq!(answer.state, AnswerState::Answered);
    assert!(corpus.vectors.query_count() > 0);
    assert_eq!(primary.call_count(), 1);
}

#[tokio::test]
async fn test_hindi_query_answers_in_hindi_from_english_chunks() {
    let corpus = corpus(&[("bio", 3)]).await;
    let primary = Arc::new(MockCompletionProvider::with_response(
        "primary",
        "परासरण जल का संचलन है (bio, Page 1).",
    ));
    let p = pipeline(&corpus, primary.clone());

    let answer = p.ask(&request("परासरण क्या है?", "c1")).await;

    assert_eq!(answer.language, Language::Hindi);
    assert_eq!(answer.state, AnswerState::Answered);
    assert!(primary.prompts()[0].contains("Write the answer in Hindi."));
}

#[tokio::test]
async fn test_streaming_sends_raw_tokens_and_returns_cleaned_answer() {
    let corpus = corpus(&[("bio", 3)]).await;
    let raw = "Sure! Osmosis moves water (bio, Page 1).";
    let primary = Arc::new(MockCompletionProvider::with_response("primary", raw));
    let p = pipeline(&corpus, primary);

    let (tx, mut rx) = mpsc::channel(64);
    let answer = p.ask_streaming(&request("What is osmosis?", "c1"), tx).await;

    let mut streamed = String::new();
    let mut done = false;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Token(t) => streamed.push_str(&t),
            StreamEvent::Done => done = true,
            StreamEvent::Error(e) => panic!("unexpected stream error: {e}"),
        }
    }
    assert!(done);
    assert_eq!(streamed, raw);
    assert_eq!(answer.text, "Osmosis moves water (bio, Page 1).");
    assert_eq!(answer.state, AnswerState::Answered);
}
