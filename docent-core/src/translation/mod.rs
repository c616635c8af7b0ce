//! Translation collaborator.
//!
//! Answers are produced in the query language by the model itself; this
//! module covers the separate translation path used by the CLI and by
//! callers that post-translate stored answers.

pub mod glossary;
pub mod process;

pub use glossary::{GlossaryLock, GlossaryTranslator, LockedText};
pub use process::ProcessTranslator;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::error::TranslationError;
use crate::types::Language;

/// Capacity of the channel returned by `translate_stream`.
pub const STREAM_BUFFER: usize = 32;

/// One event of a streamed translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationEvent {
    /// A translated unit (line or sentence) of the input.
    Chunk {
        index: usize,
        total: usize,
        text: String,
    },
    /// All units done; `text` is the joined translation.
    Complete { text: String },
    Error { message: String },
}

impl TranslationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TranslationEvent::Chunk { .. })
    }
}

/// A translation backend.
#[async_trait]
pub trait TranslationService: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<String, TranslationError>;

    /// Stream a translation unit by unit.
    ///
    /// The default implementation translates in one call and reports the
    /// result as a single chunk followed by `Complete`.
    async fn translate_stream(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<mpsc::Receiver<TranslationEvent>, TranslationError> {
        let translated = self.translate(text, src, tgt).await?;
        let (tx, rx) = mpsc::channel(2);
        // Capacity 2 holds both events without a receiver.
        let _ = tx
            .send(TranslationEvent::Chunk {
                index: 0,
                total: 1,
                text: translated.clone(),
            })
            .await;
        let _ = tx.send(TranslationEvent::Complete { text: translated }).await;
        Ok(rx)
    }
}

/// Runs one request at a time against a backend that cannot tell
/// concurrent replies apart.
///
/// A streamed request keeps the lock until its terminal event has been read,
/// even when the caller drops the receiver early.
pub struct SerializedTranslator<T> {
    inner: T,
    gate: Arc<Mutex<()>>,
}

impl<T: TranslationService> SerializedTranslator<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            gate: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl<T: TranslationService> TranslationService for SerializedTranslator<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn translate(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<String, TranslationError> {
        let _guard = self.gate.lock().await;
        self.inner.translate(text, src, tgt).await
    }

    async fn translate_stream(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<mpsc::Receiver<TranslationEvent>, TranslationError> {
        let guard = Arc::clone(&self.gate).lock_owned().await;
        let mut inner_rx = self.inner.translate_stream(text, src, tgt).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let _guard = guard;
            while let Some(event) = inner_rx.recv().await {
                let terminal = event.is_terminal();
                if !tx.is_closed() {
                    let _ = tx.send(event).await;
                }
                if terminal {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Drain a translation stream into the final text.
pub async fn collect_stream(
    mut rx: mpsc::Receiver<TranslationEvent>,
) -> Result<String, TranslationError> {
    let mut chunks = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            TranslationEvent::Chunk { text, .. } => chunks.push(text),
            TranslationEvent::Complete { text } => return Ok(text),
            TranslationEvent::Error { message } => {
                return Err(TranslationError::Failed { message });
            }
        }
    }
    if chunks.is_empty() {
        Err(TranslationError::Closed)
    } else {
        Ok(chunks.join(" "))
    }
}
