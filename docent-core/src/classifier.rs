//! Query gate: decides whether a query can be answered without retrieval.
//!
//! A fast model is asked for a JSON tag object first. On timeout, provider
//! error, or an unparseable reply the local rule table decides; when no rule
//! matches, the query proceeds to retrieval.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::prompt;
use crate::providers::CompletionProvider;
use crate::types::{ChatTurn, GateReason, Query};

/// Version of the heuristic rule tables below. Bump on any table change.
pub const HEURISTIC_RULESET_VERSION: u32 = 3;

/// Where a classification decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Model,
    Heuristic,
    /// Nothing matched; proceed to retrieval.
    Default,
}

/// Tags describing a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationDecision {
    pub is_greeting: bool,
    pub is_abusive: bool,
    pub is_chat_history_only: bool,
    pub is_gibberish: bool,
    pub needs_documents: bool,
    pub has_page_number: bool,
    pub page_number: Option<u32>,
    pub source: DecisionSource,
}

impl ClassificationDecision {
    /// A decision that sends the query to retrieval.
    pub fn proceed(source: DecisionSource) -> Self {
        Self {
            is_greeting: false,
            is_abusive: false,
            is_chat_history_only: false,
            is_gibberish: false,
            needs_documents: true,
            has_page_number: false,
            page_number: None,
            source,
        }
    }

    fn any_short_circuit_tag(&self) -> bool {
        self.is_greeting || self.is_abusive || self.is_chat_history_only || self.is_gibberish
    }

    /// Answer at the gate only when a short-circuit tag is set and the query
    /// does not also need documents.
    pub fn should_stop_at_gate(&self) -> bool {
        self.any_short_circuit_tag() && !self.needs_documents
    }

    /// The tag that decides the static response, by priority.
    pub fn gate_reason(&self) -> Option<GateReason> {
        if !self.should_stop_at_gate() {
            return None;
        }
        if self.is_abusive {
            Some(GateReason::Abusive)
        } else if self.is_gibberish {
            Some(GateReason::Gibberish)
        } else if self.is_greeting {
            Some(GateReason::Greeting)
        } else {
            Some(GateReason::ChatHistory)
        }
    }
}

/// Why a query was rejected before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    TooShort,
    TooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationOutcome {
    Invalid { reason: InvalidReason },
    Decided(ClassificationDecision),
}

// ---------------------------------------------------------------------------
// Rule tables
// ---------------------------------------------------------------------------

/// Greeting and politeness phrases, matched as whole word sequences.
const GREETING_PHRASES: &[&str] = &[
    // English
    "hi", "hii", "hello", "helo", "hey", "hola", "yo", "greetings",
    "good morning", "good afternoon", "good evening", "good night", "good day",
    "thanks", "thank you", "thankyou", "thx", "ty", "ok", "okay", "cool", "great",
    "nice", "bye", "goodbye", "see you", "see ya", "how are you", "how r u",
    "whats up", "sup", "welcome", "sorry", "please",
    // Romanized Indic
    "namaste", "namaskar", "namaskaram", "vanakkam", "dhanyavad", "dhanyawad",
    "shukriya", "ram ram", "sat sri akal", "kem cho", "aabhar",
    // Devanagari (Hindi, Marathi)
    "नमस्ते", "नमस्कार", "धन्यवाद", "शुक्रिया", "हैलो", "हाय", "राम राम",
    "सुप्रभात", "शुभ रात्रि", "आभार", "आभारी आहे",
    // Bengali, Gurmukhi, Gujarati, Tamil, Telugu, Kannada, Malayalam
    "নমস্কার", "ধন্যবাদ", "ਸਤ ਸ੍ਰੀ ਅਕਾਲ", "ਧੰਨਵਾਦ", "નમસ્તે", "આભાર",
    "வணக்கம்", "நன்றி", "నమస్కారం", "ధన్యవాదాలు", "ನಮಸ್ಕಾರ", "ಧನ್ಯವಾದ",
    "നമസ്കാരം", "നന്ദി",
];

/// Words that may accompany a greeting without adding content.
const FILLER_WORDS: &[&str] = &[
    "there", "all", "everyone", "guys", "friend", "friends", "dear", "sir", "madam",
    "maam", "bro", "buddy", "again", "so", "much", "very", "a", "lot", "and", "ji",
    "bot", "assistant", "you", "to", "for", "the", "help", "your", "jee", "जी", "आपका",
    "बहुत", "बहुत-बहुत",
];

/// Abusive terms. Any occurrence sets the abusive tag.
const ABUSIVE_TERMS: &[&str] = &[
    "idiot", "stupid", "dumb", "moron", "shut up", "fuck", "fucking", "fck", "shit",
    "bastard", "bitch", "asshole", "crap", "loser", "bakwas", "bewakoof", "bevkoof",
    "pagal", "chutiya", "kutta", "kamina", "gadha", "बकवास", "बेवकूफ", "पागल", "कुत्ता",
    "कमीना", "मूर्ख", "गधा", "मूर्खा", "येडा",
];

/// Words that mark an information request.
const QUESTION_WORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "whom", "whose", "explain",
    "describe", "define", "list", "compare", "summarize", "summarise", "tell", "give",
    "find", "show", "difference", "meaning", "chapter", "section", "document", "pdf",
    "book", "topic", "क्या", "क्यों", "कैसे", "कब", "कहाँ", "कहां", "कौन", "कौनसा",
    "समझाइए", "समझाओ", "बताइए", "बताओ", "अध्याय", "काय", "कसे", "कोणते", "सांगा",
];

/// References to the conversation itself.
static CHAT_HISTORY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bwhat (did|was) (i|my) (just )?(ask|say|said|question)",
        r"(?i)\bmy (last|previous|earlier|first) (question|message|query)",
        r"(?i)\bwhat did you (just )?(say|mean|tell)",
        r"(?i)\b(repeat|rephrase|shorten|simplify) (that|it|this|your (last )?answer|the (last )?answer)",
        r"(?i)\bsay (that|it) again\b",
        r"(?i)\b(summari[sz]e|recap) (our|this|the) (conversation|chat|discussion)",
        r"(?i)\bexplain (that|it) (again|more simply|in simpler (words|terms))",
        r"(?i)\b(your|the) (previous|last|earlier) (answer|response|reply)",
        r"(?i)\bearlier you said\b",
        r"(?i)\btranslate (that|it|your (last )?answer)\b",
        r"पिछल(ा|े) (प्रश्न|सवाल|उत्तर|जवाब)",
        r"(फिर|दोबारा) से (बताओ|बताइए|समझाओ|समझाइए)",
        r"मैंने क्या पूछा",
        r"मागील (प्रश्न|उत्तर)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static PAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:page|pg\.?|p\.)\s*(?:no\.?|number|#)?\s*(\d{1,5})\b",
        r"(?:पृष्ठ|पेज|पान)\s*(?:संख्या|क्रमांक|नंबर)?\s*(\d{1,5})",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

fn is_separator(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_punctuation()
        || matches!(c, '।' | '॥' | '…' | '‘' | '’' | '“' | '”' | '¿' | '¡')
}

/// Collapse runs of three or more identical characters to one ("hiii" -> "hi").
fn squeeze(word: &str) -> String {
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len());
    let mut i = 0;
    while i < chars.len() {
        let mut j = i;
        while j < chars.len() && chars[j] == chars[i] {
            j += 1;
        }
        let run = j - i;
        let keep = if run >= 3 { 1 } else { run };
        out.extend(std::iter::repeat_n(chars[i], keep));
        i = j;
    }
    out
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(is_separator)
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Remove every occurrence of the given phrases from a word sequence.
/// Returns the residual words and whether anything matched.
fn strip_phrases(tokens: &[String], phrases: &[&str]) -> (Vec<String>, bool) {
    let tables: Vec<Vec<&str>> = phrases
        .iter()
        .map(|p| p.split_whitespace().collect())
        .collect();
    let mut residual = Vec::new();
    let mut matched = false;
    let mut i = 0;
    'outer: while i < tokens.len() {
        for phrase in &tables {
            let n = phrase.len();
            if i + n <= tokens.len()
                && phrase
                    .iter()
                    .zip(&tokens[i..i + n])
                    .all(|(p, t)| *p == t.as_str() || *p == squeeze(t))
            {
                matched = true;
                i += n;
                continue 'outer;
            }
        }
        residual.push(tokens[i].clone());
        i += 1;
    }
    (residual, matched)
}

/// Keyboard-mash test for one Latin-letter token.
pub fn is_gibberish_token(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    if lower.len() <= 4 || !lower.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');

    let chars: Vec<char> = lower.chars().collect();
    let mut run = 1;
    let mut cluster = 0;
    let mut vowels = 0;
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && chars[i - 1] == c {
            run += 1;
            if run >= 4 {
                return true;
            }
        } else {
            run = 1;
        }
        if is_vowel(c) {
            vowels += 1;
            cluster = 0;
        } else {
            cluster += 1;
            if cluster >= 5 {
                return true;
            }
        }
    }
    (vowels as f32 / chars.len() as f32) < 0.15
}

/// What the rule tables see in a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeuristicVerdict {
    pub greeting: bool,
    /// Greeting words plus other content.
    pub greeting_with_content: bool,
    pub abusive: bool,
    pub chat_history: bool,
    pub gibberish: bool,
    pub page_number: Option<u32>,
    pub question_cue: bool,
}

impl HeuristicVerdict {
    pub fn short_circuit_signal(&self) -> bool {
        (self.greeting && !self.greeting_with_content)
            || self.abusive
            || self.chat_history
            || self.gibberish
    }

    fn matched_anything(&self) -> bool {
        self.greeting || self.abusive || self.chat_history || self.gibberish || self.page_number.is_some()
    }

    fn into_decision(self) -> ClassificationDecision {
        if !self.matched_anything() {
            return ClassificationDecision::proceed(DecisionSource::Default);
        }
        let needs_documents = self.page_number.is_some()
            || (self.greeting && self.greeting_with_content && !self.chat_history)
            || (self.abusive && self.question_cue)
            || !self.short_circuit_signal();
        ClassificationDecision {
            is_greeting: self.greeting,
            is_abusive: self.abusive,
            is_chat_history_only: self.chat_history && self.page_number.is_none(),
            is_gibberish: self.gibberish,
            needs_documents,
            has_page_number: self.page_number.is_some(),
            page_number: self.page_number,
            source: DecisionSource::Heuristic,
        }
    }
}

/// First page number referenced in `text`.
pub fn extract_page_number(text: &str) -> Option<u32> {
    PAGE_PATTERNS
        .iter()
        .filter_map(|re| re.captures(text))
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .next()
}

/// Apply the rule tables. Chat-history rules only fire when `has_history`.
pub fn evaluate_heuristics(text: &str, has_history: bool) -> HeuristicVerdict {
    let tokens = words(text);
    let page_number = extract_page_number(text);
    let question_cue = text.contains('?')
        || page_number.is_some()
        || tokens.iter().any(|t| QUESTION_WORDS.contains(&t.as_str()));

    let (after_abuse, abusive) = strip_phrases(&tokens, ABUSIVE_TERMS);
    let (after_greeting, greeting) = strip_phrases(&after_abuse, GREETING_PHRASES);
    let residual: Vec<&String> = after_greeting
        .iter()
        .filter(|w| !FILLER_WORDS.contains(&w.as_str()))
        .collect();

    let chat_history = has_history && CHAT_HISTORY_PATTERNS.iter().any(|re| re.is_match(text));

    let has_alnum = text.chars().any(char::is_alphanumeric);
    let long_tokens: Vec<&str> = residual
        .iter()
        .map(|w| w.as_str())
        .filter(|w| w.chars().count() > 4)
        .collect();
    let gibberish = !has_alnum
        || (!greeting
            && !abusive
            && !question_cue
            && !long_tokens.is_empty()
            && long_tokens.iter().all(|w| is_gibberish_token(w)));

    HeuristicVerdict {
        greeting,
        greeting_with_content: greeting && !residual.is_empty(),
        abusive,
        chat_history,
        gibberish,
        page_number,
        question_cue,
    }
}

/// Parse the model's tag object. Missing booleans are false; a missing
/// `needs_documents` is inferred from the other tags.
fn decision_from_model(value: &Value) -> Option<ClassificationDecision> {
    let obj = value.as_object()?;
    let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
    let page_number = obj.get("page_number").and_then(|v| match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    let mut decision = ClassificationDecision {
        is_greeting: flag("is_greeting"),
        is_abusive: flag("is_abusive"),
        is_chat_history_only: flag("is_chat_history_only"),
        is_gibberish: flag("is_gibberish"),
        needs_documents: false,
        has_page_number: flag("has_page_number") || page_number.is_some(),
        page_number,
        source: DecisionSource::Model,
    };
    decision.needs_documents = obj
        .get("needs_documents")
        .and_then(Value::as_bool)
        .unwrap_or(!decision.any_short_circuit_tag());
    Some(decision)
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// The query gate.
pub struct QueryClassifier {
    config: ClassifierConfig,
    model: Option<Arc<dyn CompletionProvider>>,
}

impl QueryClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            model: None,
        }
    }

    /// Use `provider` for model-first classification.
    pub fn with_model(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.model = Some(provider);
        self
    }

    /// Length gate, in characters after trimming.
    pub fn check_length(&self, query: &Query) -> Option<InvalidReason> {
        let len = query.char_len();
        if len < self.config.min_chars {
            Some(InvalidReason::TooShort)
        } else if len > self.config.max_chars {
            Some(InvalidReason::TooLong)
        } else {
            None
        }
    }

    pub async fn classify(&self, query: &Query, history: &[ChatTurn]) -> ClassificationOutcome {
        if let Some(reason) = self.check_length(query) {
            debug!(?reason, chars = query.char_len(), "Query rejected by length gate");
            return ClassificationOutcome::Invalid { reason };
        }

        let text = query.text().trim();
        let heuristics = evaluate_heuristics(text, !history.is_empty());

        let decision = match self.ask_model(text, history).await {
            Some(mut decision) => {
                if history.is_empty() {
                    decision.is_chat_history_only = false;
                }
                // Page references are extracted deterministically.
                if decision.page_number.is_none()
                    && let Some(page) = heuristics.page_number
                {
                    decision.page_number = Some(page);
                    decision.has_page_number = true;
                    decision.needs_documents = true;
                }
                if decision.should_stop_at_gate()
                    && heuristics.question_cue
                    && !heuristics.short_circuit_signal()
                {
                    info!(
                        model_greeting = decision.is_greeting,
                        model_abusive = decision.is_abusive,
                        model_chat_only = decision.is_chat_history_only,
                        model_gibberish = decision.is_gibberish,
                        heuristic_question_cue = true,
                        "Classifier and heuristics disagree, proceeding to retrieval"
                    );
                    decision.needs_documents = true;
                }
                decision
            }
            None => heuristics.into_decision(),
        };

        debug!(
            source = ?decision.source,
            stop = decision.should_stop_at_gate(),
            page = ?decision.page_number,
            ruleset = HEURISTIC_RULESET_VERSION,
            "Query classified"
        );
        ClassificationOutcome::Decided(decision)
    }

    async fn ask_model(&self, text: &str, history: &[ChatTurn]) -> Option<ClassificationDecision> {
        if !self.config.use_model {
            return None;
        }
        let model = self.model.as_ref()?;
        let prompt = prompt::classification_prompt(text, history);
        match tokio::time::timeout(self.config.timeout(), model.classify(&prompt)).await {
            Ok(Ok(value)) => {
                let decision = decision_from_model(&value);
                if decision.is_none() {
                    warn!(provider = model.name(), "Classifier reply was not a JSON object");
                }
                decision
            }
            Ok(Err(e)) => {
                warn!(provider = model.name(), error = %e, "Classifier call failed, using heuristics");
                None
            }
            Err(_) => {
                warn!(
                    provider = model.name(),
                    timeout_ms = self.config.timeout_ms,
                    "Classifier timed out, using heuristics"
                );
                None
            }
        }
    }
}
