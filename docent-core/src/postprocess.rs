//! Answer clean-up before it reaches the user.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::types::Citation;

/// Bumped whenever the meta-commentary or not-found tables change.
pub const POSTPROCESS_RULESET_VERSION: u32 = 1;

const MAX_STRIP_PASSES: usize = 8;

/// Leading process narration, tried in order on every pass.
static META_COMMENTARY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*(?:let me|i will|i'll|i am going to|i'm going to)\s+(?:search|look|check|analy[sz]e|review|find|go through|examine|scan)[^.!?:\n]*[.!?:]+\s*",
        r"(?i)^\s*(?:i am|i'm)\s+(?:now\s+)?(?:searching|analy[sz]ing|looking|reviewing|checking|examining|going through|scanning)[^.!?:\n]*[.!?:]+\s*",
        r"(?i)^\s*(?:based on|according to|from) (?:my|the|this) (?:search|analysis|review)(?: of [^,\n]+)?,\s*",
        r"(?i)^\s*(?:after|upon) (?:searching|analy[sz]ing|reviewing|checking|examining)[^,\n]*,\s*",
        r"(?i)^\s*(?:sure|certainly|of course|okay|ok|great|alright)\s*[!,.]\s*",
        r"(?i)^\s*here(?:'s| is) (?:the answer|what i found|my answer|the information)[^:\n]*:\s*",
        r"^\s*मैं\s+[^।.\n]*?(?:खोज|विश्लेषण|जाँच|जांच|देख)[^।.\n]*[।.]\s*",
        r"^\s*(?:मी|मला)\s+(?:शोध|विश्लेषण|तपास)[^।.\n]*[।.]\s*",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// "The answer is not in the documents", in the supported languages.
static NOT_FOUND: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // English
        r"(?i)\banswer (?:was|is) not (?:found|present|available) in the (?:provided )?(?:document|documents|context|text)",
        r"(?i)\b(?:could not|couldn't|cannot|can't|was unable to|am unable to) find (?:the answer|any (?:relevant )?information|this information|information about|anything about)",
        r"(?i)\bnot (?:mentioned|found|covered|available|provided) in the (?:provided |given )?(?:document|documents|context|text)",
        r"(?i)\bthe (?:provided )?(?:document|documents|context|text) (?:does not|doesn't|do not|don't) (?:contain|mention|provide|include|cover)",
        // Hindi
        r"(?:दस्ताव|डॉक्यूमेंट)\S*\s*में\s*(?:उत्तर\s*|जानकारी\s*)?(?:नहीं\s*मिल[ाी]|उपलब्ध\s*नहीं|नहीं\s*है)",
        r"(?:उत्तर|जवाब)\s*नहीं\s*मिला",
        r"जानकारी\s*(?:उपलब्ध\s*)?नहीं\s*(?:है|मिली)",
        // Marathi
        r"(?:दस्तऐवज|कागदपत्र)\S*\s*(?:उत्तर\s*|माहिती\s*)?(?:सापडल[ेी]\s*नाही|उपलब्ध\s*नाही)",
        r"(?:उत्तर|माहिती)\s*सापडल[ेी]\s*नाही",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// A cleaned answer and the citations that still apply to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessed {
    pub text: String,
    pub citations: Vec<Citation>,
    pub not_found: bool,
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Strip leading meta-commentary until none is left.
///
/// The original text is kept when stripping would leave nothing.
pub fn strip_meta_commentary(text: &str) -> String {
    let mut current = text.trim().to_string();
    let mut stripped = false;
    for _ in 0..MAX_STRIP_PASSES {
        let before = current.len();
        for re in META_COMMENTARY.iter() {
            current = re.replace(&current, "").into_owned();
        }
        if current.len() == before {
            break;
        }
        stripped = true;
    }
    let current = current.trim();
    if current.is_empty() {
        return text.trim().to_string();
    }
    if stripped {
        capitalize_first(current)
    } else {
        current.to_string()
    }
}

pub fn is_not_found(text: &str) -> bool {
    NOT_FOUND.iter().any(|re| re.is_match(text))
}

/// Clean a model answer. Not-found answers lose their citations.
pub fn postprocess(text: &str, citations: Vec<Citation>) -> PostProcessed {
    let cleaned = strip_meta_commentary(text);
    let not_found = is_not_found(&cleaned);
    let stripped = text.trim().len().saturating_sub(cleaned.len());
    if not_found || stripped > 0 {
        debug!(
            stripped,
            not_found,
            ruleset = POSTPROCESS_RULESET_VERSION,
            "Answer post-processed"
        );
    }
    PostProcessed {
        citations: if not_found { Vec::new() } else { citations },
        text: cleaned,
        not_found,
    }
}
