//! Core type definitions for Docent.
//!
//! Queries, conversation turns, retrieved evidence, assembled context
//! bundles, and the final answer handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Identifier of an ingested document.
pub type DocumentId = String;

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// Language of a query, chunk, or response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    English,
    Hindi,
    Marathi,
    Bengali,
    Punjabi,
    Gujarati,
    Tamil,
    Telugu,
    Kannada,
    Malayalam,
    Other(String),
}

impl Language {
    /// Parse an ISO 639-1 code or an NLLB/IndicTrans code (`hin_Deva`).
    pub fn from_code(code: &str) -> Self {
        let lowered = code.trim().to_lowercase();
        let base = lowered.split(['_', '-']).next().unwrap_or_default();
        match base {
            "en" | "eng" => Language::English,
            "hi" | "hin" => Language::Hindi,
            "mr" | "mar" => Language::Marathi,
            "bn" | "ben" => Language::Bengali,
            "pa" | "pan" => Language::Punjabi,
            "gu" | "guj" => Language::Gujarati,
            "ta" | "tam" => Language::Tamil,
            "te" | "tel" => Language::Telugu,
            "kn" | "kan" => Language::Kannada,
            "ml" | "mal" => Language::Malayalam,
            _ => Language::Other(base.to_string()),
        }
    }

    /// ISO 639-1 code.
    pub fn code(&self) -> &str {
        match self {
            Language::English => "en",
            Language::Hindi => "hi",
            Language::Marathi => "mr",
            Language::Bengali => "bn",
            Language::Punjabi => "pa",
            Language::Gujarati => "gu",
            Language::Tamil => "ta",
            Language::Telugu => "te",
            Language::Kannada => "kn",
            Language::Malayalam => "ml",
            Language::Other(code) => code,
        }
    }

    /// FLORES-200 code used by NLLB/IndicTrans translation backends.
    pub fn flores_code(&self) -> &str {
        match self {
            Language::English => "eng_Latn",
            Language::Hindi => "hin_Deva",
            Language::Marathi => "mar_Deva",
            Language::Bengali => "ben_Beng",
            Language::Punjabi => "pan_Guru",
            Language::Gujarati => "guj_Gujr",
            Language::Tamil => "tam_Taml",
            Language::Telugu => "tel_Telu",
            Language::Kannada => "kan_Knda",
            Language::Malayalam => "mal_Mlym",
            Language::Other(code) => code,
        }
    }

    /// Human-readable language name, used in prompt instructions.
    pub fn display_name(&self) -> &str {
        match self {
            Language::English => "English",
            Language::Hindi => "Hindi",
            Language::Marathi => "Marathi",
            Language::Bengali => "Bengali",
            Language::Punjabi => "Punjabi",
            Language::Gujarati => "Gujarati",
            Language::Tamil => "Tamil",
            Language::Telugu => "Telugu",
            Language::Kannada => "Kannada",
            Language::Malayalam => "Malayalam",
            Language::Other(code) => code,
        }
    }

    /// Detect language from the dominant Unicode script of `text`.
    ///
    /// Devanagari is reported as Hindi; Marathi callers must say so
    /// explicitly. Text without any Indic script is English.
    pub fn detect(text: &str) -> Self {
        let mut counts: HashMap<Language, usize> = HashMap::new();
        for c in text.chars() {
            let lang = match c as u32 {
                0x0900..=0x097F => Language::Hindi,
                0x0980..=0x09FF => Language::Bengali,
                0x0A00..=0x0A7F => Language::Punjabi,
                0x0A80..=0x0AFF => Language::Gujarati,
                0x0B80..=0x0BFF => Language::Tamil,
                0x0C00..=0x0C7F => Language::Telugu,
                0x0C80..=0x0CFF => Language::Kannada,
                0x0D00..=0x0D7F => Language::Malayalam,
                _ => continue,
            };
            *counts.entry(lang).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(lang, _)| lang)
            .unwrap_or(Language::English)
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::English
    }
}

impl From<String> for Language {
    fn from(code: String) -> Self {
        Language::from_code(&code)
    }
}

impl From<Language> for String {
    fn from(lang: Language) -> Self {
        lang.code().to_string()
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Query & conversation
// ---------------------------------------------------------------------------

/// An incoming question. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    id: Uuid,
    text: String,
    language: Language,
    conversation_id: String,
    received_at: DateTime<Utc>,
}

impl Query {
    /// Create a query, detecting its language from the text.
    pub fn new(text: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let text = text.into();
        let language = Language::detect(&text);
        Self {
            id: Uuid::new_v4(),
            text,
            language,
            conversation_id: conversation_id.into(),
            received_at: Utc::now(),
        }
    }

    /// Override the detected language.
    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    /// Unique per query; ties together the log lines of one request.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Length in characters of the trimmed text.
    pub fn char_len(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// A page of a document as returned by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// Which corpus (vector collection) a query runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusHandle {
    pub collection: String,
}

impl CorpusHandle {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }
}

/// A passage returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub document_id: DocumentId,
    pub page: u32,
    /// Similarity in `[0, 1]`, computed as `1 - distance`.
    pub score: f32,
    pub language: Language,
}

/// Chunks sharing one owning document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentGroup {
    pub document_id: DocumentId,
    pub chunks: Vec<RetrievedChunk>,
}

impl DocumentGroup {
    /// Group chunks by document, largest group first.
    ///
    /// Ties keep the order in which each document first appears, so the
    /// better-ranked document wins.
    pub fn group(chunks: &[RetrievedChunk]) -> Vec<DocumentGroup> {
        let mut groups: Vec<DocumentGroup> = Vec::new();
        for chunk in chunks {
            match groups
                .iter_mut()
                .find(|g| g.document_id == chunk.document_id)
            {
                Some(group) => group.chunks.push(chunk.clone()),
                None => groups.push(DocumentGroup {
                    document_id: chunk.document_id.clone(),
                    chunks: vec![chunk.clone()],
                }),
            }
        }
        groups.sort_by(|a, b| b.chunks.len().cmp(&a.chunks.len()));
        groups
    }

    /// Fraction of `total` chunks belonging to this group.
    pub fn share_of(&self, total: usize) -> f32 {
        if total == 0 {
            0.0
        } else {
            self.chunks.len() as f32 / total as f32
        }
    }
}

/// Ranked evidence for one query.
#[derive(Debug, Clone, Default)]
pub struct RankedChunks {
    /// Filtered chunks, best first.
    pub chunks: Vec<RetrievedChunk>,
    /// K chosen for the query (the vector search asked for `2 * k`).
    pub k: usize,
    /// Pages of the owning documents, resolved from the document store.
    pub documents: HashMap<DocumentId, Vec<Page>>,
    /// Set when the search was narrowed to a single dominant document.
    pub dominant_document: Option<DocumentId>,
    /// Set when retrieval failed and the result is empty by necessity.
    pub degraded: bool,
}

impl RankedChunks {
    /// An empty result produced by a failed retrieval.
    pub fn degraded() -> Self {
        Self {
            degraded: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Document ids in rank order, without duplicates.
    pub fn document_ids(&self) -> Vec<DocumentId> {
        let mut seen = HashSet::new();
        self.chunks
            .iter()
            .filter(|c| seen.insert(c.document_id.clone()))
            .map(|c| c.document_id.clone())
            .collect()
    }

    /// One citation per (document, page), best score first.
    pub fn citations(&self) -> Vec<Citation> {
        let mut seen = HashSet::new();
        self.chunks
            .iter()
            .filter(|c| seen.insert((c.document_id.clone(), c.page)))
            .map(Citation::from)
            .collect()
    }
}

/// Corpus size figures the strategy selector decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusStats {
    /// Pages across all documents matched by retrieval.
    pub total_pages: usize,
    pub document_count: usize,
}

impl CorpusStats {
    pub fn from_ranked(ranked: &RankedChunks) -> Self {
        let ids = ranked.document_ids();
        let total_pages = ids
            .iter()
            .filter_map(|id| ranked.documents.get(id))
            .map(Vec::len)
            .sum();
        Self {
            total_pages,
            document_count: ids.len(),
        }
    }
}

/// A source reference attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: DocumentId,
    pub page: u32,
    pub score: f32,
}

impl From<&RetrievedChunk> for Citation {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            page: chunk.page,
            score: chunk.score,
        }
    }
}

// ---------------------------------------------------------------------------
// Context assembly
// ---------------------------------------------------------------------------

/// How the prompt context was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FullDocument,
    SmartChunking,
    AgenticDecomposition,
    /// Chat history only; no documents were needed.
    HistoryOnly,
    /// Query (and trimmed history) only, after the budget could not be met
    /// or retrieval failed.
    Minimal,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyKind::FullDocument => "full-document",
            StrategyKind::SmartChunking => "smart-chunking",
            StrategyKind::AgenticDecomposition => "agentic-decomposition",
            StrategyKind::HistoryOnly => "history-only",
            StrategyKind::Minimal => "minimal",
        };
        write!(f, "{name}")
    }
}

/// Full text of one document, as pages.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentText {
    pub document_id: DocumentId,
    pub pages: Vec<Page>,
}

/// Answer to one sub-question of an agentic decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAnswer {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// The evidence section of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextBody {
    FullDocument { documents: Vec<DocumentText> },
    Chunks { chunks: Vec<RetrievedChunk> },
    SubAnswers { answers: Vec<SubAnswer> },
    Empty,
}

impl ContextBody {
    /// Render the evidence as page-tagged text.
    pub fn render(&self) -> String {
        match self {
            ContextBody::FullDocument { documents } => documents
                .iter()
                .flat_map(|doc| {
                    doc.pages.iter().map(move |page| {
                        format!(
                            "[Document: {} | Page {}]\n{}",
                            doc.document_id,
                            page.number,
                            page.text.trim()
                        )
                    })
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            ContextBody::Chunks { chunks } => chunks
                .iter()
                .map(|c| {
                    format!(
                        "[Document: {} | Page {}]\n{}",
                        c.document_id,
                        c.page,
                        c.text.trim()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            ContextBody::SubAnswers { answers } => answers
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    format!(
                        "Sub-question {}: {}\nFindings: {}",
                        i + 1,
                        a.question,
                        a.answer.trim()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            ContextBody::Empty => String::new(),
        }
    }
}

/// Context handed to the model orchestrator.
///
/// Invariant: `prompt_tokens + max_output_tokens + safety_margin` never
/// exceeds the model's context window.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBundle {
    pub strategy: StrategyKind,
    /// Question as it appears in the prompt; truncated only by the minimal
    /// fallback.
    pub question: String,
    pub body: ContextBody,
    /// How many of the most recent history turns the prompt includes.
    pub history_window: usize,
    pub prompt_tokens: usize,
    pub max_output_tokens: usize,
    pub shrink_passes: u8,
    pub citations: Vec<Citation>,
}

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// Why the gate answered without retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Greeting,
    Abusive,
    Gibberish,
    ChatHistory,
}

/// Terminal state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnswerState {
    Answered,
    ShortCircuited { reason: GateReason },
    Invalid,
    NotFoundInCorpus,
    /// Retrieval or every model provider failed; the answer is best-effort.
    Degraded,
}

/// Output of the model orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAnswer {
    pub text: String,
    pub provider_used: String,
    pub cached: bool,
    pub duration_ms: u64,
}

/// The response returned to callers of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    #[serde(flatten)]
    pub state: AnswerState,
    pub strategy: Option<StrategyKind>,
    pub provider_used: Option<String>,
    pub cached: bool,
    pub duration_ms: u64,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_queries: Vec<String>,
}

impl Answer {
    /// An answer produced without any model call.
    pub fn fixed(text: impl Into<String>, state: AnswerState, language: Language) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
            state,
            strategy: None,
            provider_used: None,
            cached: false,
            duration_ms: 0,
            language,
            sub_queries: Vec::new(),
        }
    }
}
