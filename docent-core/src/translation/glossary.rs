//! Scientific-term locking around English to Hindi translation.
//!
//! Generic MT models translate terms like "photosynthesis" inconsistently.
//! Before translation each known term is swapped for an opaque `SCI{n}`
//! placeholder; afterwards the placeholder is replaced by the fixed Hindi
//! term.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tokio::sync::mpsc;

use super::{TranslationEvent, TranslationService};
use crate::error::TranslationError;
use crate::types::Language;

const ENGLISH_HINDI_TERMS: &[(&str, &str)] = &[
    // Biology
    ("photosynthesis", "प्रकाश संश्लेषण"),
    ("chlorophyll", "क्लोरोफिल"),
    ("carbon dioxide", "कार्बन डाइऑक्साइड"),
    ("oxygen", "ऑक्सीजन"),
    ("glucose", "ग्लूकोज"),
    ("atp", "एटीपी"),
    ("dna", "डीएनए"),
    ("rna", "आरएनए"),
    ("cell", "कोशिका"),
    ("mitochondria", "माइटोकॉन्ड्रिया"),
    ("nucleus", "केंद्रक"),
    ("chromosome", "गुणसूत्र"),
    ("gene", "जीन"),
    ("protein", "प्रोटीन"),
    ("enzyme", "एंजाइम"),
    ("respiration", "श्वसन"),
    ("digestion", "पाचन"),
    ("metabolism", "चयापचय"),
    // Chemistry
    ("molecule", "अणु"),
    ("atom", "परमाणु"),
    ("element", "तत्व"),
    ("compound", "यौगिक"),
    ("reaction", "अभिक्रिया"),
    ("catalyst", "उत्प्रेरक"),
    ("acid", "अम्ल"),
    ("base", "क्षार"),
    ("salt", "लवण"),
    ("solution", "विलयन"),
    ("mixture", "मिश्रण"),
    ("hydrogen", "हाइड्रोजन"),
    ("nitrogen", "नाइट्रोजन"),
    ("sodium", "सोडियम"),
    ("calcium", "कैल्शियम"),
    // Physics
    ("force", "बल"),
    ("energy", "ऊर्जा"),
    ("velocity", "वेग"),
    ("acceleration", "त्वरण"),
    ("momentum", "संवेग"),
    ("gravity", "गुरुत्वाकर्षण"),
    ("friction", "घर्षण"),
    ("pressure", "दबाव"),
    ("temperature", "तापमान"),
    ("heat", "ऊष्मा"),
    ("light", "प्रकाश"),
    ("sound", "ध्वनि"),
    ("wave", "तरंग"),
    ("electricity", "विद्युत"),
    ("magnetism", "चुंबकत्व"),
    // Mathematics
    ("equation", "समीकरण"),
    ("formula", "सूत्र"),
    ("variable", "चर"),
    ("constant", "अचर"),
    ("function", "कार्य"),
    ("derivative", "अवकलज"),
    ("integral", "समाकलन"),
    ("angle", "कोण"),
    ("triangle", "त्रिभुज"),
    ("circle", "वृत्त"),
    ("square", "वर्ग"),
    ("rectangle", "आयत"),
    ("area", "क्षेत्रफल"),
    ("perimeter", "परिमाप"),
    ("volume", "आयतन"),
    // General academic
    ("definition", "परिभाषा"),
    ("example", "उदाहरण"),
    ("concept", "अवधारणा"),
    ("principle", "सिद्धांत"),
    ("theory", "सिद्धांत"),
    ("law", "नियम"),
    ("process", "प्रक्रिया"),
    ("system", "तंत्र"),
    ("structure", "संरचना"),
];

/// Text with its glossary terms replaced by placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedText {
    pub text: String,
    /// `(placeholder, target term)` in placeholder order.
    pub replacements: Vec<(String, String)>,
}

impl LockedText {
    /// Put the target terms back. Only exact placeholders are replaced;
    /// a placeholder the translator altered is left as is.
    pub fn restore(&self, translated: &str) -> String {
        // Highest index first so SCI1 never eats the prefix of SCI10.
        self.replacements
            .iter()
            .rev()
            .fold(translated.to_string(), |acc, (placeholder, term)| {
                acc.replace(placeholder.as_str(), term)
            })
    }
}

/// A case-insensitive source-term to target-term table.
#[derive(Debug, Clone)]
pub struct GlossaryLock {
    source: Language,
    target: Language,
    terms: HashMap<String, String>,
    pattern: Option<Regex>,
}

impl GlossaryLock {
    pub fn new<I, S, T>(source: Language, target: Language, terms: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let terms: HashMap<String, String> = terms
            .into_iter()
            .map(|(s, t)| (s.into().to_lowercase(), t.into()))
            .collect();

        let mut keys: Vec<&String> = terms.keys().collect();
        // Longest first so "carbon dioxide" wins over shorter overlaps.
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let alternation = keys
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = if alternation.is_empty() {
            None
        } else {
            RegexBuilder::new(&format!(r"\b(?:{alternation})\b"))
                .case_insensitive(true)
                .build()
                .ok()
        };

        Self {
            source,
            target,
            terms,
            pattern,
        }
    }

    /// Built-in English to Hindi science glossary.
    pub fn english_hindi() -> Self {
        Self::new(
            Language::English,
            Language::Hindi,
            ENGLISH_HINDI_TERMS.iter().copied(),
        )
    }

    pub fn applies_to(&self, src: &Language, tgt: &Language) -> bool {
        *src == self.source && *tgt == self.target
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Replace every known term with `SCI{n}`, numbering occurrences in order.
    pub fn lock(&self, text: &str) -> LockedText {
        let Some(pattern) = &self.pattern else {
            return LockedText {
                text: text.to_string(),
                replacements: Vec::new(),
            };
        };
        let mut replacements = Vec::new();
        let locked = pattern.replace_all(text, |caps: &regex::Captures<'_>| {
            let matched = caps[0].to_lowercase();
            match self.terms.get(&matched) {
                Some(term) => {
                    let placeholder = format!("SCI{}", replacements.len());
                    replacements.push((placeholder.clone(), term.clone()));
                    placeholder
                }
                None => caps[0].to_string(),
            }
        });
        LockedText {
            text: locked.into_owned(),
            replacements,
        }
    }
}

/// Wraps a translator with glossary locking for the glossary's language pair.
pub struct GlossaryTranslator<T> {
    inner: T,
    glossary: GlossaryLock,
}

impl<T: TranslationService> GlossaryTranslator<T> {
    pub fn new(inner: T, glossary: GlossaryLock) -> Self {
        Self { inner, glossary }
    }
}

#[async_trait]
impl<T: TranslationService> TranslationService for GlossaryTranslator<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn translate(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<String, TranslationError> {
        if !self.glossary.applies_to(src, tgt) {
            return self.inner.translate(text, src, tgt).await;
        }
        let locked = self.glossary.lock(text);
        let translated = self.inner.translate(&locked.text, src, tgt).await?;
        Ok(locked.restore(&translated))
    }

    async fn translate_stream(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<mpsc::Receiver<TranslationEvent>, TranslationError> {
        if !self.glossary.applies_to(src, tgt) {
            return self.inner.translate_stream(text, src, tgt).await;
        }
        let locked = self.glossary.lock(text);
        let mut inner_rx = self.inner.translate_stream(&locked.text, src, tgt).await?;
        if locked.replacements.is_empty() {
            return Ok(inner_rx);
        }
        let (tx, rx) = mpsc::channel(super::STREAM_BUFFER);
        tokio::spawn(async move {
            while let Some(event) = inner_rx.recv().await {
                let event = match event {
                    TranslationEvent::Chunk { index, total, text } => TranslationEvent::Chunk {
                        index,
                        total,
                        text: locked.restore(&text),
                    },
                    TranslationEvent::Complete { text } => TranslationEvent::Complete {
                        text: locked.restore(&text),
                    },
                    err @ TranslationEvent::Error { .. } => err,
                };
                if tx.send(event).await.is_err() {
                    // Keep the inner stream draining.
                    while inner_rx.recv().await.is_some() {}
                    break;
                }
            }
        });
        Ok(rx)
    }
}
