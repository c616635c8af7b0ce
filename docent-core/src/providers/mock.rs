//! A queue-based mock completion provider for testing and development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionOptions, CompletionProvider, StreamEvent};
use crate::error::ProviderError;

type Reply = Result<String, ProviderError>;

/// Mock provider. Queued replies are consumed first, then the fallback reply
/// repeats forever.
pub struct MockCompletionProvider {
    name: String,
    context_window: usize,
    delay: Option<Duration>,
    fallback: Reply,
    responses: Mutex<VecDeque<Reply>>,
    classifications: Mutex<VecDeque<Result<serde_json::Value, ProviderError>>>,
    /// Streaming fails with this many tokens already sent.
    stream_failure_after: Option<usize>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    classify_calls: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockCompletionProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context_window: 128_000,
            delay: None,
            fallback: Ok("I'm a mock model. No queued responses available.".to_string()),
            responses: Mutex::new(VecDeque::new()),
            classifications: Mutex::new(VecDeque::new()),
            stream_failure_after: None,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
        }
    }

    /// A provider that always answers with `text`.
    pub fn with_response(name: impl Into<String>, text: &str) -> Self {
        Self {
            fallback: Ok(text.to_string()),
            ..Self::new(name)
        }
    }

    /// A provider whose every call fails with `err`.
    pub fn failing(name: impl Into<String>, err: ProviderError) -> Self {
        Self {
            fallback: Err(err),
            ..Self::new(name)
        }
    }

    /// Sleep this long (on the tokio clock) before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Make streaming fail after `tokens` tokens have been sent.
    pub fn with_stream_failure_after(mut self, tokens: usize) -> Self {
        self.stream_failure_after = Some(tokens);
        self
    }

    /// Queue a reply for the next `complete` call.
    pub fn queue_response(&self, text: &str) {
        lock(&self.responses).push_back(Ok(text.to_string()));
    }

    /// Queue an error for the next `complete` call.
    pub fn queue_error(&self, err: ProviderError) {
        lock(&self.responses).push_back(Err(err));
    }

    /// Queue a JSON object for the next `classify` call.
    pub fn queue_classification(&self, value: serde_json::Value) {
        lock(&self.classifications).push_back(Ok(value));
    }

    /// Number of `complete`/`complete_streaming` calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn classify_count(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    /// Every prompt received by `complete`/`complete_streaming`, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    async fn next_reply(&self, prompt: &str) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = lock(&self.responses).pop_front();
        queued.unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.next_reply(prompt).await
    }

    async fn classify(&self, _prompt: &str) -> Result<serde_json::Value, ProviderError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(queued) = lock(&self.classifications).pop_front() {
            return queued;
        }
        match &self.fallback {
            Err(e) => Err(e.clone()),
            Ok(_) => Err(ProviderError::ResponseParse {
                message: "no classification queued".to_string(),
            }),
        }
    }

    async fn complete_streaming(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let text = self.next_reply(prompt).await?;
        for (sent, word) in text.split_inclusive(' ').enumerate() {
            if self.stream_failure_after == Some(sent) {
                return Err(ProviderError::Streaming {
                    message: "mock stream interrupted".to_string(),
                });
            }
            if tx.send(StreamEvent::Token(word.to_string())).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }
}
