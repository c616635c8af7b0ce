//! Model orchestrator: answer cache, retries, circuit breaker, fallback.
//!
//! `answer` never fails. A request is served from the answer cache, the
//! primary provider (guarded by its breaker, retried with backoff), a
//! single fallback attempt, or finally a static localized apology.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CachedAnswer, ResponseCache};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorClass, ProviderError};
use crate::locale::Message;
use crate::metrics::PipelineMetrics;
use crate::providers::{
    CircuitBreaker, CompletionOptions, CompletionProvider, RetryPolicy, StreamEvent, with_backoff,
};
use crate::types::{ChatTurn, ContextBundle, Language, ModelAnswer};

/// Provider name reported when every model failed.
pub const STATIC_PROVIDER: &str = "static";

/// One call made to a completion provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAttempt {
    pub provider: String,
    pub succeeded: bool,
    pub class: Option<ErrorClass>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Result of forwarding one provider stream.
struct Streamed {
    text: String,
    emitted: usize,
    consumer_gone: bool,
    result: Result<(), ProviderError>,
}

pub struct ModelOrchestrator {
    primary: Arc<dyn CompletionProvider>,
    fallback: Option<Arc<dyn CompletionProvider>>,
    cache: Arc<ResponseCache>,
    breaker: Arc<tokio::sync::Mutex<CircuitBreaker>>,
    retry: RetryPolicy,
    timeout: Duration,
    temperature: f32,
    cache_prefix_bytes: usize,
    attempt_window: usize,
    attempts: Mutex<VecDeque<ModelAttempt>>,
    metrics: Arc<PipelineMetrics>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ModelOrchestrator {
    pub fn new(
        primary: Arc<dyn CompletionProvider>,
        cache: Arc<ResponseCache>,
        config: &OrchestratorConfig,
    ) -> Self {
        let breaker = CircuitBreaker::from_config(primary.name(), config);
        Self {
            primary,
            fallback: None,
            cache,
            breaker: Arc::new(tokio::sync::Mutex::new(breaker)),
            retry: RetryPolicy::for_models(config),
            timeout: config.timeout(),
            temperature: config.temperature,
            cache_prefix_bytes: config.cache_context_prefix_bytes,
            attempt_window: config.attempt_window.max(1),
            attempts: Mutex::new(VecDeque::new()),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn CompletionProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Context window of the primary model.
    pub fn context_window(&self) -> usize {
        self.primary.context_window()
    }

    pub fn breaker(&self) -> Arc<tokio::sync::Mutex<CircuitBreaker>> {
        Arc::clone(&self.breaker)
    }

    /// The most recent provider calls, oldest first.
    pub fn recent_attempts(&self) -> Vec<ModelAttempt> {
        lock(&self.attempts).iter().cloned().collect()
    }

    /// Answer the bundle's question.
    pub async fn answer(
        &self,
        bundle: &ContextBundle,
        history: &[ChatTurn],
        language: &Language,
    ) -> ModelAnswer {
        let key = self.cache_key(bundle, history, language);
        if let Some(hit) = self.cached(&key) {
            return hit;
        }

        let started = Instant::now();
        let prompt = bundle.render_prompt(history, language);
        let options = self.options(bundle);

        if self.primary_permitted().await {
            let result = with_backoff(&self.retry, self.primary.name(), |_| {
                self.attempt(&self.primary, &prompt, &options)
            })
            .await;
            self.settle_primary(&result).await;
            match result {
                Ok(text) => return self.finish(key, text, self.primary.name(), started),
                Err(e) => warn!(
                    provider = %self.primary.name(),
                    error = %e,
                    "Primary model failed"
                ),
            }
        }

        if let Some(fallback) = &self.fallback {
            self.metrics.record_fallback_use();
            match self.attempt(fallback, &prompt, &options).await {
                Ok(text) => {
                    info!(provider = %fallback.name(), "Answered by fallback model");
                    return self.finish(key, text, fallback.name(), started);
                }
                Err(e) => warn!(provider = %fallback.name(), error = %e, "Fallback model failed"),
            }
        }

        self.apology(language, started)
    }

    /// Stream the answer to `tx` and return the full text once finished.
    ///
    /// Tokens are forwarded as they arrive. The fallback is only tried when
    /// the primary failed before emitting anything. Dropping the receiver
    /// stops forwarding.
    pub async fn answer_streaming(
        &self,
        bundle: &ContextBundle,
        history: &[ChatTurn],
        language: &Language,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ModelAnswer {
        let key = self.cache_key(bundle, history, language);
        if let Some(hit) = self.cached(&key) {
            if tx.send(StreamEvent::Token(hit.text.clone())).await.is_ok() {
                let _ = tx.send(StreamEvent::Done).await;
            }
            return hit;
        }

        let started = Instant::now();
        let prompt = bundle.render_prompt(history, language);
        let options = self.options(bundle);

        let mut candidates: Vec<(&Arc<dyn CompletionProvider>, bool)> = Vec::with_capacity(2);
        if self.primary_permitted().await {
            candidates.push((&self.primary, true));
        }
        if let Some(fallback) = &self.fallback {
            candidates.push((fallback, false));
        }

        for (provider, is_primary) in candidates {
            if !is_primary {
                self.metrics.record_fallback_use();
            }
            let streamed = self.stream_from(provider, &prompt, &options, &tx).await;
            if streamed.consumer_gone || tx.is_closed() {
                // A producer error here may only reflect the closed channel.
                if is_primary && streamed.result.is_ok() {
                    self.settle_primary(&streamed.result).await;
                }
                debug!(provider = %provider.name(), "Stream consumer dropped");
                return ModelAnswer {
                    text: streamed.text,
                    provider_used: provider.name().to_string(),
                    cached: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
            if is_primary {
                self.settle_primary(&streamed.result).await;
            }
            match streamed.result {
                Ok(()) => {
                    let _ = tx.send(StreamEvent::Done).await;
                    return self.finish(key, streamed.text, provider.name(), started);
                }
                Err(e) if streamed.emitted > 0 => {
                    warn!(
                        provider = %provider.name(),
                        tokens = streamed.emitted,
                        error = %e,
                        "Stream failed after output started"
                    );
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    return ModelAnswer {
                        text: streamed.text,
                        provider_used: provider.name().to_string(),
                        cached: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => warn!(provider = %provider.name(), error = %e, "Stream failed before output"),
            }
        }

        let answer = self.apology(language, started);
        if tx.send(StreamEvent::Token(answer.text.clone())).await.is_ok() {
            let _ = tx.send(StreamEvent::Done).await;
        }
        answer
    }

    fn options(&self, bundle: &ContextBundle) -> CompletionOptions {
        CompletionOptions {
            temperature: self.temperature,
            max_tokens: bundle.max_output_tokens,
        }
    }

    fn cache_key(&self, bundle: &ContextBundle, history: &[ChatTurn], language: &Language) -> CacheKey {
        let start = history.len().saturating_sub(bundle.history_window);
        let mut context: String = history[start..]
            .iter()
            .map(|turn| format!("{}: {}\n", turn.role, turn.text))
            .collect();
        context.push_str(&bundle.body.render());
        CacheKey::for_answer(
            &context,
            &bundle.question,
            language,
            self.primary.name(),
            self.cache_prefix_bytes,
        )
    }

    fn cached(&self, key: &CacheKey) -> Option<ModelAnswer> {
        match self.cache.get(key) {
            Some(hit) => {
                self.metrics.record_cache_hit();
                debug!(key = %key, provider = %hit.provider, "Answer cache hit");
                Some(ModelAnswer {
                    text: hit.text,
                    provider_used: hit.provider,
                    cached: true,
                    duration_ms: 0,
                })
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    fn finish(&self, key: CacheKey, text: String, provider: &str, started: Instant) -> ModelAnswer {
        self.cache.insert(
            key,
            CachedAnswer {
                text: text.clone(),
                provider: provider.to_string(),
            },
        );
        ModelAnswer {
            text,
            provider_used: provider.to_string(),
            cached: false,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn apology(&self, language: &Language, started: Instant) -> ModelAnswer {
        self.metrics.record_static_fallback();
        warn!("All models failed, answering with static apology");
        ModelAnswer {
            text: Message::Apology.text(language).to_string(),
            provider_used: STATIC_PROVIDER.to_string(),
            cached: false,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn primary_permitted(&self) -> bool {
        let permitted = self.breaker.lock().await.is_call_permitted();
        if !permitted {
            debug!(provider = %self.primary.name(), "Circuit open, skipping primary");
        }
        permitted
    }

    async fn settle_primary<T>(&self, result: &Result<T, ProviderError>) {
        let mut breaker = self.breaker.lock().await;
        match result {
            Ok(_) => breaker.record_success(),
            Err(_) => {
                self.metrics.record_primary_failure();
                if breaker.record_failure() {
                    self.metrics.record_breaker_trip();
                }
            }
        }
    }

    /// One timed call. Empty completions count as failures.
    async fn attempt(
        &self,
        provider: &Arc<dyn CompletionProvider>,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, provider.complete(prompt, options)).await {
            Ok(Ok(text)) if text.trim().is_empty() => Err(ProviderError::ResponseParse {
                message: "empty completion".to_string(),
            }),
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        };
        self.record_attempt(provider.name(), result.as_ref().err(), started);
        result
    }

    async fn stream_from(
        &self,
        provider: &Arc<dyn CompletionProvider>,
        prompt: &str,
        options: &CompletionOptions,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Streamed {
        let started = Instant::now();
        let (inner_tx, mut inner_rx) = mpsc::channel(64);
        let produce =
            tokio::time::timeout(self.timeout, provider.complete_streaming(prompt, options, inner_tx));
        // Owns the receiver so the producer sees a closed channel once forwarding stops.
        let forward = async move {
            let mut text = String::new();
            let mut emitted = 0;
            while let Some(event) = inner_rx.recv().await {
                match event {
                    StreamEvent::Token(token) => {
                        if tx.send(StreamEvent::Token(token.clone())).await.is_err() {
                            return (text, emitted, true);
                        }
                        text.push_str(&token);
                        emitted += 1;
                    }
                    StreamEvent::Done | StreamEvent::Error(_) => break,
                }
            }
            (text, emitted, false)
        };
        let (produced, (text, emitted, consumer_gone)) = tokio::join!(produce, forward);
        let result = match produced {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        };
        self.record_attempt(provider.name(), result.as_ref().err(), started);
        Streamed {
            text,
            emitted,
            consumer_gone,
            result,
        }
    }

    fn timeout_error(&self) -> ProviderError {
        ProviderError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn record_attempt(&self, provider: &str, error: Option<&ProviderError>, started: Instant) {
        let attempt = ModelAttempt {
            provider: provider.to_string(),
            succeeded: error.is_none(),
            class: error.map(ProviderError::class),
            error: error.map(ToString::to_string),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let mut attempts = lock(&self.attempts);
        if attempts.len() == self.attempt_window {
            attempts.pop_front();
        }
        attempts.push_back(attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::providers::MockCompletionProvider;
    use crate::types::{ContextBody, StrategyKind};

    fn bundle(question: &str) -> ContextBundle {
        ContextBundle {
            strategy: StrategyKind::Minimal,
            question: question.into(),
            body: ContextBody::Empty,
            history_window: 6,
            prompt_tokens: 20,
            max_output_tokens: 200,
            shrink_passes: 0,
            citations: Vec::new(),
        }
    }

    fn orchestrator(
        primary: Arc<MockCompletionProvider>,
        fallback: Option<Arc<MockCompletionProvider>>,
    ) -> ModelOrchestrator {
        let cache = Arc::new(ResponseCache::answers(&CacheConfig::default()));
        let o = ModelOrchestrator::new(primary, cache, &OrchestratorConfig::default());
        match fallback {
            Some(f) => o.with_fallback(f),
            None => o,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> (String, Vec<StreamEvent>) {
        let mut text = String::new();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Token(t) = &event {
                text.push_str(t);
            }
            events.push(event);
        }
        (text, events)
    }

    #[tokio::test]
    async fn test_primary_answer_then_cache_hit() {
        let primary = Arc::new(MockCompletionProvider::with_response("primary", "Water moves."));
        let o = orchestrator(primary.clone(), None);
        let b = bundle("What is osmosis?");

        let first = o.answer(&b, &[], &Language::English).await;
        assert_eq!(first.text, "Water moves.");
        assert_eq!(first.provider_used, "primary");
        assert!(!first.cached);

        let second = o.answer(&b, &[], &Language::English).await;
        assert!(second.cached);
        assert_eq!(second.duration_ms, 0);
        assert_eq!(second.text, first.text);
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_key_includes_language_and_history() {
        let primary = Arc::new(MockCompletionProvider::with_response("primary", "ok"));
        let o = orchestrator(primary.clone(), None);
        let b = bundle("What did I ask?");
        o.answer(&b, &[], &Language::English).await;
        o.answer(&b, &[], &Language::Hindi).await;
        o.answer(&b, &[ChatTurn::user("about cells")], &Language::English).await;
        assert_eq!(primary.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_goes_straight_to_fallback() {
        let primary = Arc::new(MockCompletionProvider::failing(
            "primary",
            ProviderError::AuthFailed {
                provider: "primary".into(),
            },
        ));
        let fallback = Arc::new(MockCompletionProvider::with_response("fallback", "From fallback."));
        let o = orchestrator(primary.clone(), Some(fallback.clone()));

        let answer = o.answer(&bundle("q"), &[], &Language::English).await;
        assert_eq!(primary.call_count(), 1);
        assert_eq!(answer.provider_used, "fallback");
        assert_eq!(answer.text, "From fallback.");

        let attempts = o.recent_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].class, Some(ErrorClass::AuthQuota));
        assert!(attempts[1].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let primary = Arc::new(MockCompletionProvider::with_response("primary", "Recovered."));
        primary.queue_error(ProviderError::ServerError {
            status: 503,
            message: "busy".into(),
        });
        primary.queue_error(ProviderError::Connection {
            message: "reset".into(),
        });
        let o = orchestrator(primary.clone(), None);
        let answer = o.answer(&bundle("q"), &[], &Language::English).await;
        assert_eq!(answer.text, "Recovered.");
        assert_eq!(primary.call_count(), 3);
        assert_eq!(o.breaker().lock().await.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let primary = Arc::new(
            MockCompletionProvider::with_response("primary", "late")
                .with_delay(Duration::from_secs(31)),
        );
        let fallback = Arc::new(MockCompletionProvider::with_response("fallback", "on time"));
        let o = orchestrator(primary.clone(), Some(fallback));
        let answer = o.answer(&bundle("q"), &[], &Language::English).await;
        assert_eq!(primary.call_count(), 3);
        assert_eq!(answer.provider_used, "fallback");
        assert_eq!(
            o.recent_attempts()[0].class,
            Some(ErrorClass::Transient)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_apology_is_not_cached() {
        let err = ProviderError::ClientError {
            status: 400,
            message: "bad".into(),
        };
        let primary = Arc::new(MockCompletionProvider::failing("primary", err.clone()));
        let fallback = Arc::new(MockCompletionProvider::failing("fallback", err));
        let o = orchestrator(primary.clone(), Some(fallback.clone()));

        let answer = o.answer(&bundle("q"), &[], &Language::Hindi).await;
        assert_eq!(answer.provider_used, STATIC_PROVIDER);
        assert_eq!(answer.text, Message::Apology.text(&Language::Hindi));

        o.answer(&bundle("q"), &[], &Language::Hindi).await;
        assert_eq!(primary.call_count(), 2);
        assert_eq!(fallback.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_skips_primary_until_cooldown() {
        let primary = Arc::new(MockCompletionProvider::failing(
            "primary",
            ProviderError::ClientError {
                status: 400,
                message: "bad".into(),
            },
        ));
        let fallback = Arc::new(MockCompletionProvider::with_response("fallback", "ok"));
        let o = orchestrator(primary.clone(), Some(fallback));
        let metrics = Arc::new(PipelineMetrics::new());
        let o = o.with_metrics(metrics.clone());

        for i in 0..5 {
            o.answer(&bundle(&format!("q{i}")), &[], &Language::English).await;
        }
        assert_eq!(primary.call_count(), 5);
        assert!(o.breaker().lock().await.is_open());

        o.answer(&bundle("q5"), &[], &Language::English).await;
        assert_eq!(primary.call_count(), 5);

        tokio::time::advance(Duration::from_secs(60)).await;
        o.answer(&bundle("q6"), &[], &Language::English).await;
        assert_eq!(primary.call_count(), 6);

        let snap = metrics.snapshot();
        assert_eq!(snap.breaker_trips, 1);
        assert_eq!(snap.primary_failures, 6);
    }

    #[tokio::test]
    async fn test_streaming_forwards_tokens() {
        let primary = Arc::new(MockCompletionProvider::with_response("primary", "one two three"));
        let o = orchestrator(primary, None);
        let (tx, rx) = mpsc::channel(16);
        let answer = o.answer_streaming(&bundle("q"), &[], &Language::English, tx).await;
        let (text, events) = drain(rx).await;
        assert_eq!(text, "one two three");
        assert_eq!(answer.text, "one two three");
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_stream_falls_back_only_before_first_token() {
        let primary = Arc::new(
            MockCompletionProvider::with_response("primary", "a b c").with_stream_failure_after(0),
        );
        let fallback = Arc::new(MockCompletionProvider::with_response("fallback", "from fallback"));
        let o = orchestrator(primary, Some(fallback.clone()));
        let (tx, rx) = mpsc::channel(16);
        let answer = o.answer_streaming(&bundle("q"), &[], &Language::English, tx).await;
        let (text, _) = drain(rx).await;
        assert_eq!(answer.provider_used, "fallback");
        assert_eq!(text, "from fallback");

        let primary = Arc::new(
            MockCompletionProvider::with_response("primary", "a b c").with_stream_failure_after(1),
        );
        let fallback = Arc::new(MockCompletionProvider::with_response("fallback", "unused"));
        let o = orchestrator(primary, Some(fallback.clone()));
        let (tx, rx) = mpsc::channel(16);
        let answer = o.answer_streaming(&bundle("q"), &[], &Language::English, tx).await;
        let (text, events) = drain(rx).await;
        assert_eq!(text, "a ");
        assert_eq!(answer.provider_used, "primary");
        assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_consumer_drop_stops_forwarding() {
        let words = vec!["word"; 500].join(" ");
        let primary = Arc::new(MockCompletionProvider::with_response("primary", &words));
        let o = orchestrator(primary.clone(), None);
        let (tx, mut rx) = mpsc::channel(1);
        let consumer = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });
        let answer = o.answer_streaming(&bundle("q"), &[], &Language::English, tx).await;
        assert!(matches!(consumer.await.unwrap(), Some(StreamEvent::Token(_))));
        assert!(answer.text.len() < words.len());
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_attempt_window_is_bounded() {
        let primary = Arc::new(MockCompletionProvider::with_response("primary", "ok"));
        let cache = Arc::new(ResponseCache::answers(&CacheConfig::default()));
        let config = OrchestratorConfig {
            attempt_window: 2,
            ..Default::default()
        };
        let o = ModelOrchestrator::new(primary, cache, &config);
        for i in 0..4 {
            o.answer(&bundle(&format!("q{i}")), &[], &Language::English).await;
        }
        assert_eq!(o.recent_attempts().len(), 2);
    }

    /// Streams one token, then fails once its channel closes.
    struct FailsOnClosedChannel;

    #[async_trait::async_trait]
    impl CompletionProvider for FailsOnClosedChannel {
        fn name(&self) -> &str {
            "primary"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<String, ProviderError> {
            Ok("unused".to_string())
        }

        async fn complete_streaming(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            let _ = tx.send(StreamEvent::Token("partial ".to_string())).await;
            tx.closed().await;
            Err(ProviderError::Streaming {
                message: "receiver dropped".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_dropped_consumer_is_not_a_primary_failure() {
        let fallback = Arc::new(MockCompletionProvider::with_response("fallback", "unused"));
        let metrics = Arc::new(PipelineMetrics::new());
        let cache = Arc::new(ResponseCache::answers(&CacheConfig::default()));
        let o = ModelOrchestrator::new(Arc::new(FailsOnClosedChannel), cache, &OrchestratorConfig::default())
            .with_fallback(fallback.clone())
            .with_metrics(Arc::clone(&metrics));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let answer = o.answer_streaming(&bundle("q"), &[], &Language::English, tx).await;

        assert_eq!(answer.provider_used, "primary");
        assert!(!answer.cached);
        assert_eq!(fallback.call_count(), 0);
        assert_eq!(o.breaker().lock().await.failure_count(), 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.primary_failures, 0);
        assert_eq!(snap.fallback_uses, 0);
    }
}
