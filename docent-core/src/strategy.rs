//! Context strategy selection and token budgeting.
//!
//! Decides how much of the corpus a prompt carries (whole documents, a
//! window of ranked chunks, or sub-question findings) and shrinks the
//! window until the rendered prompt fits the model's context.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::tokens::TokenCounter;
use crate::types::{
    ChatTurn, Citation, ContextBody, ContextBundle, CorpusStats, DocumentText, Language,
    RankedChunks, RetrievedChunk, StrategyKind, SubAnswer,
};

/// Bumped whenever the complexity or decomposition rules change.
pub const COMPLEXITY_RULESET_VERSION: u32 = 2;

/// Ordered complexity rules. The first match names the signal.
static COMPLEXITY_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("compare", r"(?i)\bcompar(?:e|es|ed|ing|ison|isons)\b"),
        ("contrast", r"(?i)\bcontrast(?:s|ed|ing)?\b"),
        (
            "difference",
            r"(?i)\b(?:differ|differs|difference|differences|distinguish)\b",
        ),
        ("versus", r"(?i)\b(?:vs\.?|versus)(?:\s|$)"),
        ("similarity", r"(?i)\bsimilarit(?:y|ies)\b"),
        (
            "enumeration",
            r"(?i)\b(?:chapter|section|unit|part|lesson|page)s?\s+\d+\s*(?:,\s*\d+\s*)*(?:and|&)\s+(?:(?:chapter|section|unit|part|lesson|page)s?\s+)?\d+\b",
        ),
        ("first_then", r"(?i)\bfirst\b.+\bthen\b"),
        ("before_after", r"(?i)\bbefore\b.+\bafter\b|\bafter\b.+\bbefore\b"),
        ("both_and", r"(?i)\bboth\b.+\band\b"),
        ("relationship", r"(?i)\brelation(?:ship)? between\b"),
        ("indic_compare", r"तुलना|अंतर|फ़र्क|फर्क|फरक"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
});

/// Name of the first complexity rule the query matches.
pub fn complexity_signal(query: &str) -> Option<&'static str> {
    COMPLEXITY_RULES
        .iter()
        .find(|(_, re)| re.is_match(query))
        .map(|(name, _)| *name)
}

pub fn is_complex(query: &str) -> bool {
    complexity_signal(query).is_some()
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

const SECTION_KINDS: &str = "chapter|section|unit|part|lesson|page|article|figure|table";

static ENUMERATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b({SECTION_KINDS})s?\s+(\d+(?:\s*(?:,|and|&|or)\s*(?:(?:{SECTION_KINDS})s?\s+)?\d+)+)"
    ))
    .expect("enumeration pattern is valid")
});
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid"));
static BETWEEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbetween\s+(.+?)\s+and\s+(.+?)\s*(?:[?.!।]|$)").expect("valid")
});
static BOTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bboth\s+(.+?)\s+and\s+(.+?)\s*(?:[?.!।]|$)").expect("valid")
});
static VERSUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?)\s+(?:vs\.?|versus)\s+(.+?)\s*(?:[?.!।]|$)").expect("valid")
});
static COMPARE_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:compare|contrast)\s+(.+?)\s+(?:and|with|to|against)\s+(.+?)\s*(?:[?.!।]|$)")
        .expect("valid")
});
static BEFORE_AND_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbefore\s+and\s+after\b").expect("valid"));
static SEQUENCE_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:;|,?\s*\bthen\b|,?\s*\bafter that\b|,?\s*\bafterwards\b)\s*")
        .expect("valid")
});
static CONJUNCTION_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(?:and also|as well as|and|और|आणि)\s+").expect("valid")
});
static LEADING_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:first(?:ly)?|then|next|finally|also|and)\b[,\s]*").expect("valid")
});
static LEADING_ASK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:compare|contrast|what is|what are|what's|how does|how do|explain|describe)\s+",
    )
    .expect("valid")
});

/// Words trimmed from either end of a leftover topic phrase.
const TOPIC_EDGE_WORDS: &[&str] = &[
    "compare", "contrast", "comparison", "difference", "differences", "similarities",
    "between", "what", "is", "are", "the", "in", "of", "from", "and", "how", "do", "does",
    "differ", "explain", "describe", "tell", "me", "about", "across", "for", "summarize",
    "summarise", "summary", "list", "discuss", "give",
];

fn clean_phrase(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c == '।' || c.is_whitespace())
        .to_string()
}

fn topic_from(text: &str) -> String {
    let mut words: Vec<&str> = text.split_whitespace().collect();
    let is_edge = |w: &str| {
        let w = w
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();
        w.is_empty() || TOPIC_EDGE_WORDS.contains(&w.as_str())
    };
    while words.first().is_some_and(|w| is_edge(*w)) {
        words.remove(0);
    }
    while words.last().is_some_and(|w| is_edge(*w)) {
        words.pop();
    }
    clean_phrase(&words.join(" "))
}

fn about(entity: &str) -> String {
    format!("What does the document say about {entity}?")
}

fn entity_list(first: &str, last: &str) -> Vec<String> {
    first
        .split(',')
        .chain(std::iter::once(last))
        .map(clean_phrase)
        .filter(|e| !e.is_empty())
        .collect()
}

fn by_enumeration(query: &str) -> Vec<String> {
    let Some(caps) = ENUMERATION.captures(query) else {
        return Vec::new();
    };
    let kind = caps[1].to_lowercase();
    let whole = caps.get(0).map_or("", |m| m.as_str());
    let topic = topic_from(&query.replacen(whole, " ", 1));
    DIGITS
        .find_iter(&caps[2])
        .map(|n| {
            if topic.is_empty() {
                format!("Summarize the key points of {kind} {}.", n.as_str())
            } else {
                format!("What does {kind} {} say about {topic}?", n.as_str())
            }
        })
        .collect()
}

fn by_entity_pair(re: &Regex, query: &str) -> Vec<String> {
    re.captures(query)
        .map(|caps| entity_list(&caps[1], &caps[2]).iter().map(|e| about(e)).collect())
        .unwrap_or_default()
}

fn by_between(query: &str) -> Vec<String> {
    by_entity_pair(&BETWEEN, query)
}

fn by_both(query: &str) -> Vec<String> {
    by_entity_pair(&BOTH, query)
}

fn by_compare_pair(query: &str) -> Vec<String> {
    by_entity_pair(&COMPARE_PAIR, query)
}

fn by_versus(query: &str) -> Vec<String> {
    let Some(caps) = VERSUS.captures(query.trim()) else {
        return Vec::new();
    };
    let left = LEADING_ASK.replace(caps[1].trim(), "");
    entity_list(&left, &caps[2]).iter().map(|e| about(e)).collect()
}

fn by_before_after(query: &str) -> Vec<String> {
    if !BEFORE_AND_AFTER.is_match(query) {
        return Vec::new();
    }
    ["before", "after"]
        .iter()
        .map(|word| clean_phrase(&BEFORE_AND_AFTER.replace(query, *word)) + "?")
        .collect()
}

fn clauses(query: &str, splitter: &Regex) -> Vec<String> {
    let parts: Vec<String> = splitter
        .split(query)
        .map(|part| clean_phrase(&LEADING_CUE.replace(part.trim(), "")))
        .collect();
    // Only split when every piece can stand on its own.
    if parts.len() < 2 || parts.iter().any(|p| p.split_whitespace().count() < 2) {
        return Vec::new();
    }
    parts.into_iter().map(|p| capitalize(&p)).collect()
}

fn by_sequence(query: &str) -> Vec<String> {
    clauses(query, &SEQUENCE_SPLIT)
}

fn by_conjunction(query: &str) -> Vec<String> {
    clauses(query, &CONJUNCTION_SPLIT)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Decomposition rules, tried in order until one yields two or more parts.
const DECOMPOSITION_RULES: &[fn(&str) -> Vec<String>] = &[
    by_enumeration,
    by_between,
    by_both,
    by_versus,
    by_compare_pair,
    by_before_after,
    by_sequence,
    by_conjunction,
];

/// Split a complex query into between 2 and `max` sub-questions.
///
/// Deterministic: the same query always yields the same sub-questions.
pub fn decompose(query: &str, max: usize) -> Vec<String> {
    let max = max.clamp(2, 4);
    for rule in DECOMPOSITION_RULES {
        let mut seen = HashSet::new();
        let parts: Vec<String> = rule(query)
            .into_iter()
            .filter(|p| seen.insert(p.to_lowercase()))
            .take(max)
            .collect();
        if parts.len() >= 2 {
            return parts;
        }
    }
    let question = clean_phrase(query);
    vec![
        format!("What background does the document give for: {question}?"),
        format!("{}?", capitalize(&question)),
    ]
}

// ---------------------------------------------------------------------------
// Token budget
// ---------------------------------------------------------------------------

/// Output budget for one model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub context_window: usize,
    pub safety_margin: usize,
    pub min_output: usize,
    pub max_output: usize,
}

impl TokenBudget {
    /// Budget for a model whose own window may be smaller than the configured one.
    pub fn new(config: &StrategyConfig, model_window: usize) -> Self {
        Self {
            context_window: config.context_window.min(model_window),
            safety_margin: config.safety_margin,
            min_output: config.min_output_tokens,
            max_output: config.max_output_tokens,
        }
    }

    /// Whether a prompt of this size leaves room for the minimum output.
    pub fn fits(&self, prompt_tokens: usize) -> bool {
        prompt_tokens + self.min_output + self.safety_margin <= self.context_window
    }

    /// `clamp(min, max, window - prompt - margin)`.
    pub fn max_output_tokens(&self, prompt_tokens: usize) -> usize {
        self.context_window
            .saturating_sub(prompt_tokens + self.safety_margin)
            .min(self.max_output)
            .max(self.min_output)
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// What to do with a document query.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextPlan {
    /// Send this bundle to the model.
    Ready(ContextBundle),
    /// Answer each sub-query separately, then synthesize.
    Decompose { sub_queries: Vec<String> },
}

type Window = (StrategyKind, ContextBody, Vec<Citation>);

pub struct ContextStrategySelector {
    config: StrategyConfig,
    budget: TokenBudget,
    history_window: usize,
    tokens: TokenCounter,
}

fn chunk_citations(chunks: &[RetrievedChunk]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| seen.insert((c.document_id.clone(), c.page)))
        .map(Citation::from)
        .collect()
}

fn chunk_window(ranked: &RankedChunks, k: usize) -> Window {
    let chunks: Vec<RetrievedChunk> = ranked.chunks.iter().take(k.max(1)).cloned().collect();
    let citations = chunk_citations(&chunks);
    (
        StrategyKind::SmartChunking,
        ContextBody::Chunks { chunks },
        citations,
    )
}

fn full_documents(ranked: &RankedChunks) -> Option<Window> {
    let documents: Vec<DocumentText> = ranked
        .document_ids()
        .into_iter()
        .filter_map(|id| {
            ranked.documents.get(&id).map(|pages| DocumentText {
                document_id: id.clone(),
                pages: pages.clone(),
            })
        })
        .collect();
    if documents.is_empty() {
        return None;
    }
    Some((
        StrategyKind::FullDocument,
        ContextBody::FullDocument { documents },
        ranked.citations(),
    ))
}

/// Upper bound on shrink passes. Each pass halves the window, so more buys nothing.
pub const MAX_SHRINK_PASSES: u8 = 2;

impl ContextStrategySelector {
    pub fn new(mut config: StrategyConfig, history_window: usize, model_window: usize) -> Self {
        config.max_shrink_passes = config.max_shrink_passes.min(MAX_SHRINK_PASSES);
        Self {
            budget: TokenBudget::new(&config, model_window),
            config,
            history_window,
            tokens: TokenCounter::cl100k(),
        }
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn choose_strategy(&self, query: &str, stats: &CorpusStats) -> StrategyKind {
        let complex = is_complex(query);
        if stats.total_pages <= self.config.full_document_page_limit && !complex {
            StrategyKind::FullDocument
        } else if complex {
            StrategyKind::AgenticDecomposition
        } else {
            StrategyKind::SmartChunking
        }
    }

    /// Pick a strategy for a document query and build its context.
    pub fn select_and_build(
        &self,
        query: &str,
        ranked: &RankedChunks,
        stats: &CorpusStats,
        history: &[ChatTurn],
        language: &Language,
    ) -> ContextPlan {
        let strategy = self.choose_strategy(query, stats);
        info!(
            strategy = %strategy,
            total_pages = stats.total_pages,
            documents = stats.document_count,
            signal = complexity_signal(query).unwrap_or("none"),
            ruleset = COMPLEXITY_RULESET_VERSION,
            "Context strategy selected"
        );
        match strategy {
            StrategyKind::AgenticDecomposition => ContextPlan::Decompose {
                sub_queries: decompose(query, self.config.max_sub_queries),
            },
            StrategyKind::FullDocument => {
                ContextPlan::Ready(self.build_documents(query, ranked, true, history, language))
            }
            _ => ContextPlan::Ready(self.build_documents(query, ranked, false, history, language)),
        }
    }

    /// Context for one sub-question. Never decomposes further.
    pub fn build_focused(
        &self,
        query: &str,
        ranked: &RankedChunks,
        stats: &CorpusStats,
        history: &[ChatTurn],
        language: &Language,
    ) -> ContextBundle {
        let whole = stats.total_pages <= self.config.full_document_page_limit;
        self.build_documents(query, ranked, whole, history, language)
    }

    fn build_documents(
        &self,
        query: &str,
        ranked: &RankedChunks,
        whole: bool,
        history: &[ChatTurn],
        language: &Language,
    ) -> ContextBundle {
        let full = if whole { full_documents(ranked) } else { None };
        let k = ranked.k.max(1);
        self.fit(query, history, language, |pass| match &full {
            Some(window) if pass == 0 => window.clone(),
            Some(_) => chunk_window(ranked, k >> (pass - 1)),
            None => chunk_window(ranked, k >> pass),
        })
    }

    /// Context that combines sub-question findings into one answer.
    pub fn build_synthesis(
        &self,
        query: &str,
        answers: &[SubAnswer],
        history: &[ChatTurn],
        language: &Language,
    ) -> ContextBundle {
        let mut seen = HashSet::new();
        let citations: Vec<Citation> = answers
            .iter()
            .flat_map(|a| a.citations.iter())
            .filter(|c| seen.insert((c.document_id.clone(), c.page)))
            .cloned()
            .collect();
        self.fit(query, history, language, |pass| {
            let answers = answers
                .iter()
                .map(|a| {
                    let mut a = a.clone();
                    if pass > 0 {
                        let keep = self.tokens.count(&a.answer) >> pass;
                        a.answer = self.tokens.truncate(&a.answer, keep);
                    }
                    a
                })
                .collect();
            (
                StrategyKind::AgenticDecomposition,
                ContextBody::SubAnswers { answers },
                citations.clone(),
            )
        })
    }

    /// Context for a question about the conversation itself.
    pub fn build_history_only(
        &self,
        query: &str,
        history: &[ChatTurn],
        language: &Language,
    ) -> ContextBundle {
        let bundle = self.bundle(StrategyKind::HistoryOnly, query, ContextBody::Empty, self.history_window);
        let prompt_tokens = self.count(&bundle, history, language);
        if self.budget.fits(prompt_tokens) {
            return self.seal(bundle, prompt_tokens, 0, Vec::new());
        }
        self.build_minimal(query, history, language)
    }

    /// Query plus as much recent history as fits, with no document context.
    pub fn build_minimal(
        &self,
        query: &str,
        history: &[ChatTurn],
        language: &Language,
    ) -> ContextBundle {
        self.minimal(query, history, language, 0)
    }

    fn fit<F>(&self, query: &str, history: &[ChatTurn], language: &Language, mut window: F) -> ContextBundle
    where
        F: FnMut(u8) -> Window,
    {
        for pass in 0..=self.config.max_shrink_passes {
            let (strategy, body, citations) = window(pass);
            let bundle = self.bundle(strategy, query, body, self.history_window);
            let prompt_tokens = self.count(&bundle, history, language);
            if self.budget.fits(prompt_tokens) {
                return self.seal(bundle, prompt_tokens, pass, citations);
            }
            debug!(
                strategy = %strategy,
                pass,
                prompt_tokens,
                window = self.budget.context_window,
                "Context over budget, shrinking"
            );
        }
        self.minimal(query, history, language, self.config.max_shrink_passes)
    }

    fn minimal(&self, query: &str, history: &[ChatTurn], language: &Language, passes: u8) -> ContextBundle {
        for window in (0..=self.history_window.min(history.len())).rev() {
            let bundle = self.bundle(StrategyKind::Minimal, query, ContextBody::Empty, window);
            let prompt_tokens = self.count(&bundle, history, language);
            if self.budget.fits(prompt_tokens) {
                return self.seal(bundle, prompt_tokens, passes, Vec::new());
            }
        }

        // Even the bare question is too long: cut it down.
        let mut question = query.to_string();
        loop {
            let bundle = self.bundle(StrategyKind::Minimal, &question, ContextBody::Empty, 0);
            let prompt_tokens = self.count(&bundle, history, language);
            if self.budget.fits(prompt_tokens) || question.is_empty() {
                debug!(prompt_tokens, "Question truncated to fit the context window");
                return self.seal(bundle, prompt_tokens, passes, Vec::new());
            }
            let over = prompt_tokens + self.budget.min_output + self.budget.safety_margin
                - self.budget.context_window;
            let keep = self.tokens.count(&question).saturating_sub(over);
            let next = self.tokens.truncate(&question, keep);
            if next.len() < question.len() {
                question = next;
            } else {
                question.pop();
            }
        }
    }

    fn bundle(&self, strategy: StrategyKind, question: &str, body: ContextBody, history_window: usize) -> ContextBundle {
        ContextBundle {
            strategy,
            question: question.to_string(),
            body,
            history_window,
            prompt_tokens: 0,
            max_output_tokens: 0,
            shrink_passes: 0,
            citations: Vec::new(),
        }
    }

    fn count(&self, bundle: &ContextBundle, history: &[ChatTurn], language: &Language) -> usize {
        self.tokens.count(&bundle.render_prompt(history, language))
    }

    fn seal(&self, mut bundle: ContextBundle, prompt_tokens: usize, passes: u8, citations: Vec<Citation>) -> ContextBundle {
        bundle.prompt_tokens = prompt_tokens;
        bundle.max_output_tokens = self.budget.max_output_tokens(prompt_tokens);
        bundle.shrink_passes = passes;
        bundle.citations = citations;
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Page;

    fn chunk(doc: &str, page: u32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            text: text.into(),
            document_id: doc.into(),
            page,
            score: 0.9,
            language: Language::English,
        }
    }

    fn ranked(pages: usize, page_text: &str, chunks: Vec<RetrievedChunk>, k: usize) -> RankedChunks {
        let mut r = RankedChunks {
            chunks,
            k,
            ..Default::default()
        };
        r.documents.insert(
            "bio".into(),
            (1..=pages as u32)
                .map(|n| Page {
                    number: n,
                    text: page_text.into(),
                })
                .collect(),
        );
        r
    }

    fn selector(window: usize) -> ContextStrategySelector {
        let config = StrategyConfig {
            context_window: window,
            ..Default::default()
        };
        ContextStrategySelector::new(config, 6, usize::MAX)
    }

    fn assert_within_budget(s: &ContextStrategySelector, b: &ContextBundle) {
        let budget = s.budget();
        assert!(
            b.prompt_tokens + b.max_output_tokens + budget.safety_margin <= budget.context_window,
            "{} + {} + {} > {}",
            b.prompt_tokens,
            b.max_output_tokens,
            budget.safety_margin,
            budget.context_window
        );
    }

    #[test]
    fn test_complexity_rules() {
        assert_eq!(complexity_signal("Compare chapter 1 and chapter 3"), Some("compare"));
        assert_eq!(complexity_signal("mitosis vs meiosis"), Some("versus"));
        assert_eq!(
            complexity_signal("What is the relationship between heat and work?"),
            Some("relationship")
        );
        assert_eq!(complexity_signal("Summarize chapters 2 and 5"), Some("enumeration"));
        assert_eq!(complexity_signal("प्रकाश और छाया की तुलना करें"), Some("indic_compare"));
        assert!(!is_complex("What is osmosis?"));
        assert!(!is_complex("What is on page 5?"));
    }

    #[test]
    fn test_decompose_enumerated_chapters() {
        assert_eq!(
            decompose("Compare chapter 1 and chapter 3", 4),
            vec![
                "Summarize the key points of chapter 1.".to_string(),
                "Summarize the key points of chapter 3.".to_string(),
            ]
        );
        assert_eq!(
            decompose("Compare the causes of war in chapter 1 and chapter 3", 4),
            vec![
                "What does chapter 1 say about causes of war?".to_string(),
                "What does chapter 3 say about causes of war?".to_string(),
            ]
        );
    }

    #[test]
    fn test_decompose_caps_at_max() {
        let parts = decompose("Summarize chapters 1, 2, 3, 4 and 5", 4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3], "Summarize the key points of chapter 4.");
        assert_eq!(decompose("Summarize chapters 1, 2, 3, 4 and 5", 9).len(), 4);
    }

    #[test]
    fn test_decompose_entities() {
        assert_eq!(
            decompose("What is the difference between mitosis and meiosis?", 4),
            vec![
                "What does the document say about mitosis?".to_string(),
                "What does the document say about meiosis?".to_string(),
            ]
        );
        assert_eq!(
            decompose("Compare mitosis vs meiosis", 4),
            decompose("mitosis versus meiosis?", 4)
        );
    }

    #[test]
    fn test_decompose_sequence() {
        assert_eq!(
            decompose("First explain photosynthesis, then describe respiration", 4),
            vec![
                "Explain photosynthesis".to_string(),
                "Describe respiration".to_string(),
            ]
        );
    }

    #[test]
    fn test_decompose_is_deterministic_and_bounded() {
        for q in ["Contrast them", "Compare", "How do the two ideas differ?"] {
            let a = decompose(q, 4);
            assert_eq!(a, decompose(q, 4));
            assert!((2..=4).contains(&a.len()), "{q}: {a:?}");
        }
    }

    #[test]
    fn test_strategy_table() {
        let s = selector(128_000);
        let small = CorpusStats {
            total_pages: 50,
            document_count: 1,
        };
        let large = CorpusStats {
            total_pages: 300,
            document_count: 2,
        };
        assert_eq!(s.choose_strategy("What is osmosis?", &small), StrategyKind::FullDocument);
        assert_eq!(s.choose_strategy("What is osmosis?", &large), StrategyKind::SmartChunking);
        assert_eq!(
            s.choose_strategy("Compare osmosis and diffusion", &small),
            StrategyKind::AgenticDecomposition
        );
        assert_eq!(
            s.choose_strategy("Compare osmosis and diffusion", &large),
            StrategyKind::AgenticDecomposition
        );
    }

    #[test]
    fn test_budget_clamps() {
        let b = TokenBudget {
            context_window: 10_000,
            safety_margin: 500,
            min_output: 100,
            max_output: 8_000,
        };
        assert_eq!(b.max_output_tokens(1_000), 8_000);
        assert_eq!(b.max_output_tokens(9_000), 500);
        assert!(b.fits(9_400));
        assert_eq!(b.max_output_tokens(9_400), 100);
        assert!(!b.fits(9_401));
    }

    #[test]
    fn test_budget_respects_smaller_model_window() {
        let b = TokenBudget::new(&StrategyConfig::default(), 8_192);
        assert_eq!(b.context_window, 8_192);
    }

    #[test]
    fn test_full_document_fits() {
        let s = selector(128_000);
        let r = ranked(3, "Osmosis moves water.", vec![chunk("bio", 2, "Osmosis")], 3);
        let stats = CorpusStats::from_ranked(&r);
        let ContextPlan::Ready(bundle) =
            s.select_and_build("What is osmosis?", &r, &stats, &[], &Language::English)
        else {
            panic!("expected a ready bundle");
        };
        assert_eq!(bundle.strategy, StrategyKind::FullDocument);
        assert_eq!(bundle.shrink_passes, 0);
        assert_eq!(bundle.max_output_tokens, 8_000);
        assert_eq!(bundle.citations.len(), 1);
        assert!(bundle.body.render().contains("[Document: bio | Page 3]"));
        assert_within_budget(&s, &bundle);
    }

    #[test]
    fn test_full_document_shrinks_to_chunks() {
        let s = selector(3_000);
        let page = "word ".repeat(400);
        let chunks = vec![
            chunk("bio", 7, "pinned page text"),
            chunk("bio", 2, "second"),
            chunk("bio", 3, "third"),
        ];
        let r = ranked(20, &page, chunks, 3);
        let stats = CorpusStats::from_ranked(&r);
        let bundle = s.build_focused("What is osmosis?", &r, &stats, &[], &Language::English);
        assert_eq!(bundle.strategy, StrategyKind::SmartChunking);
        assert_eq!(bundle.shrink_passes, 1);
        let ContextBody::Chunks { chunks } = &bundle.body else {
            panic!("expected chunks");
        };
        assert_eq!(chunks[0].page, 7);
        assert_within_budget(&s, &bundle);
    }

    #[test]
    fn test_falls_back_to_minimal() {
        let s = selector(3_000);
        let big = "lorem ".repeat(2_000);
        let chunks = (1..=4).map(|p| chunk("bio", p, &big)).collect();
        let r = ranked(4, &big, chunks, 4);
        let stats = CorpusStats::from_ranked(&r);
        let history = vec![ChatTurn::user("earlier question"), ChatTurn::assistant("earlier answer")];
        let bundle = s.build_focused("What is osmosis?", &r, &stats, &history, &Language::English);
        assert_eq!(bundle.strategy, StrategyKind::Minimal);
        assert_eq!(bundle.shrink_passes, 2);
        assert_eq!(bundle.body, ContextBody::Empty);
        assert!(bundle.citations.is_empty());
        assert_within_budget(&s, &bundle);
    }

    #[test]
    fn test_shrink_passes_are_capped() {
        let config = StrategyConfig {
            context_window: 3_000,
            max_shrink_passes: 70,
            ..Default::default()
        };
        let s = ContextStrategySelector::new(config, 6, usize::MAX);
        let big = "lorem ".repeat(2_000);
        let chunks = (1..=4).map(|p| chunk("bio", p, &big)).collect();
        let r = ranked(4, &big, chunks, 4);
        let stats = CorpusStats::from_ranked(&r);
        let bundle = s.build_focused("What is osmosis?", &r, &stats, &[], &Language::English);
        assert_eq!(bundle.strategy, StrategyKind::Minimal);
        assert_eq!(bundle.shrink_passes, MAX_SHRINK_PASSES);
        assert_within_budget(&s, &bundle);
    }

    #[test]
    fn test_minimal_truncates_oversized_question() {
        let s = selector(3_000);
        let question = "why ".repeat(5_000);
        let bundle = s.build_minimal(&question, &[], &Language::English);
        assert!(bundle.question.len() < question.len());
        assert_within_budget(&s, &bundle);
    }

    #[test]
    fn test_synthesis_merges_citations() {
        let s = selector(128_000);
        let cite = |page| Citation {
            document_id: "bio".into(),
            page,
            score: 0.8,
        };
        let answers = vec![
            SubAnswer {
                question: "q1".into(),
                answer: "a1".into(),
                citations: vec![cite(1), cite(2)],
            },
            SubAnswer {
                question: "q2".into(),
                answer: "a2".into(),
                citations: vec![cite(2)],
            },
        ];
        let bundle = s.build_synthesis("Compare", &answers, &[], &Language::English);
        assert_eq!(bundle.strategy, StrategyKind::AgenticDecomposition);
        assert_eq!(bundle.citations.len(), 2);
        assert!(bundle.body.render().contains("Sub-question 2: q2"));
    }

    #[test]
    fn test_history_only_keeps_window() {
        let s = selector(128_000);
        let history: Vec<ChatTurn> = (0..10).map(|i| ChatTurn::user(format!("turn {i}"))).collect();
        let bundle = s.build_history_only("What did I ask?", &history, &Language::English);
        assert_eq!(bundle.strategy, StrategyKind::HistoryOnly);
        assert_eq!(bundle.history_window, 6);
    }
}
