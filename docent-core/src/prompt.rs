//! Prompt templates.
//!
//! `ContextBundle::render_prompt` is the only place a model prompt is
//! assembled, so the strategy selector's token estimates match what the
//! orchestrator actually sends.

use crate::types::{ChatTurn, ContextBody, ContextBundle, Language, Role, StrategyKind};

/// Exact sentence the model is told to use when the context lacks the answer.
pub const NOT_FOUND_SENTENCE: &str = "The answer was not found in the document.";

const ANSWER_RULES: &str = "\
Rules:
- Answer directly. Do not describe your search, analysis, or reasoning process.
- Cite the source of every fact as (Document, Page N).
- Use only the information provided below.";

fn instructions(strategy: StrategyKind) -> &'static str {
    match strategy {
        StrategyKind::FullDocument | StrategyKind::SmartChunking => {
            "You answer questions about the user's documents using the document context below."
        }
        StrategyKind::AgenticDecomposition => {
            "The question was split into sub-questions that were answered separately. \
             Combine the findings below into one coherent answer to the original question."
        }
        StrategyKind::HistoryOnly => {
            "The user is asking about the conversation itself. Answer from the conversation so far."
        }
        StrategyKind::Minimal => {
            "No document context is available for this question. Answer from the conversation \
             if it contains the answer."
        }
    }
}

fn render_history(history: &[ChatTurn], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", turn.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ContextBundle {
    /// Render the full prompt for this bundle.
    pub fn render_prompt(&self, history: &[ChatTurn], language: &Language) -> String {
        let mut sections = vec![instructions(self.strategy).to_string(), ANSWER_RULES.to_string()];
        sections.push(format!(
            "- If the information needed is not present, reply exactly: \"{NOT_FOUND_SENTENCE}\"\n\
             - Write the answer in {}.",
            language.display_name()
        ));

        let conversation = render_history(history, self.history_window);
        if !conversation.is_empty() {
            sections.push(format!("Conversation so far:\n{conversation}"));
        }

        let context = self.body.render();
        if !context.is_empty() {
            let heading = match self.body {
                ContextBody::SubAnswers { .. } => "Findings",
                _ => "Document context",
            };
            sections.push(format!("{heading}:\n{context}"));
        }

        sections.push(format!("Question: {}\nAnswer:", self.question.trim()));
        sections.join("\n\n")
    }
}

/// Prompt asking the fast model for the gate's JSON tag object.
pub fn classification_prompt(query: &str, history: &[ChatTurn]) -> String {
    let conversation = render_history(history, 4);
    let conversation = if conversation.is_empty() {
        "(no previous messages)".to_string()
    } else {
        conversation
    };
    format!(
        "Classify the user's message for a document question-answering assistant.\n\
         Reply with a single JSON object and nothing else, using these keys:\n\
         {{\"is_greeting\": bool, \"is_abusive\": bool, \"is_chat_history_only\": bool, \
         \"is_gibberish\": bool, \"needs_documents\": bool, \"has_page_number\": bool, \
         \"page_number\": number or null}}\n\
         - is_greeting: only a greeting, thanks, or small talk\n\
         - is_abusive: insults or abusive language\n\
         - is_chat_history_only: answerable from the previous messages alone\n\
         - is_gibberish: random characters or keyboard mashing\n\
         - needs_documents: the user wants information from their documents\n\n\
         Previous messages:\n{conversation}\n\n\
         Message: {}",
        query.trim()
    )
}

/// Question text sent for one sub-question of a decomposed query.
pub fn sub_question_text(original: &str, sub_question: &str) -> String {
    format!("{sub_question} (part of the larger question: {})", original.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetrievedChunk;

    fn bundle(strategy: StrategyKind, question: &str, body: ContextBody, window: usize) -> ContextBundle {
        ContextBundle {
            strategy,
            question: question.into(),
            body,
            history_window: window,
            prompt_tokens: 0,
            max_output_tokens: 100,
            shrink_passes: 0,
            citations: Vec::new(),
        }
    }

    #[test]
    fn test_prompt_contains_context_and_language() {
        let b = bundle(
            StrategyKind::SmartChunking,
            "What absorbs light?",
            ContextBody::Chunks {
                chunks: vec![RetrievedChunk {
                    text: "Chlorophyll absorbs light.".into(),
                    document_id: "bio".into(),
                    page: 4,
                    score: 0.9,
                    language: Language::English,
                }],
            },
            6,
        );
        let prompt = b.render_prompt(&[], &Language::Hindi);
        assert!(prompt.contains("[Document: bio | Page 4]"));
        assert!(prompt.contains("Write the answer in Hindi."));
        assert!(prompt.contains(NOT_FOUND_SENTENCE));
        assert!(prompt.ends_with("Question: What absorbs light?\nAnswer:"));
        assert!(!prompt.contains("Conversation so far"));
    }

    #[test]
    fn test_prompt_history_window() {
        let history: Vec<ChatTurn> = (0..5).map(|i| ChatTurn::user(format!("turn {i}"))).collect();
        let b = bundle(StrategyKind::HistoryOnly, "what did I ask?", ContextBody::Empty, 2);
        let prompt = b.render_prompt(&history, &Language::English);
        assert!(prompt.contains("User: turn 4"));
        assert!(prompt.contains("User: turn 3"));
        assert!(!prompt.contains("turn 2"));
    }

    #[test]
    fn test_classification_prompt_lists_keys() {
        let prompt = classification_prompt("hello", &[]);
        assert!(prompt.contains("\"needs_documents\""));
        assert!(prompt.contains("(no previous messages)"));
        assert!(prompt.ends_with("Message: hello"));
    }
}
