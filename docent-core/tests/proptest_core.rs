//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use docent_core::config::{ClassifierConfig, StrategyConfig};
use docent_core::postprocess::strip_meta_commentary;
use docent_core::strategy::{TokenBudget, decompose};
use docent_core::translation::GlossaryLock;
use docent_core::types::Query;
use docent_core::QueryClassifier;

// --- Token budget properties ---

proptest! {
    #[test]
    fn budget_output_is_always_within_bounds(
        window in 4_000usize..200_000,
        margin in 0usize..2_000,
        min_output in 1usize..1_000,
        extra in 0usize..10_000,
        prompt in 0usize..250_000,
    ) {
        let config = StrategyConfig {
            context_window: window,
            safety_margin: margin,
            min_output_tokens: min_output,
            max_output_tokens: min_output + extra,
            ..StrategyConfig::default()
        };
        let budget = TokenBudget::new(&config, usize::MAX);
        let out = budget.max_output_tokens(prompt);
        prop_assert!(out >= budget.min_output);
        prop_assert!(out <= budget.max_output);
        if budget.fits(prompt) {
            prop_assert!(prompt + budget.min_output + budget.safety_margin <= budget.context_window);
        }
    }

    #[test]
    fn budget_never_exceeds_model_window(
        configured in 4_000usize..200_000,
        model in 4_000usize..200_000,
    ) {
        let config = StrategyConfig {
            context_window: configured,
            ..StrategyConfig::default()
        };
        prop_assert_eq!(TokenBudget::new(&config, model).context_window, configured.min(model));
    }
}

// --- Length gate properties ---

proptest! {
    #[test]
    fn length_gate_matches_trimmed_char_count(text in "\\PC{0,60}") {
        let config = ClassifierConfig {
            min_chars: 2,
            max_chars: 40,
            ..ClassifierConfig::default()
        };
        let classifier = QueryClassifier::new(config);
        let query = Query::new(text.clone(), "c1");
        let len = text.trim().chars().count();
        let rejected = classifier.check_length(&query).is_some();
        prop_assert_eq!(rejected, !(2..=40).contains(&len));
    }
}

// --- Decomposition properties ---

proptest! {
    #[test]
    fn decomposition_yields_two_to_max_questions(
        query in "[a-zA-Z ,]{1,80}",
        max in 0usize..10,
    ) {
        let parts = decompose(&query, max);
        prop_assert!(parts.len() >= 2);
        prop_assert!(parts.len() <= max.clamp(2, 4));
        prop_assert_eq!(parts.clone(), decompose(&query, max));
    }
}

// --- Post-processing properties ---

proptest! {
    #[test]
    fn stripping_never_empties_an_answer(text in "\\PC{1,120}") {
        prop_assume!(!text.trim().is_empty());
        prop_assert!(!strip_meta_commentary(&text).is_empty());
    }
}

// --- Glossary properties ---

proptest! {
    #[test]
    fn glossary_restore_leaves_no_placeholders(
        words in prop::collection::vec(
            prop::sample::select(vec![
                "the", "cell", "uses", "energy", "and", "Carbon", "dioxide", "LIGHT", "in",
                "photosynthesis", "database", "heat",
            ]),
            0..30,
        )
    ) {
        let text = words.join(" ");
        let glossary = GlossaryLock::english_hindi();
        let locked = glossary.lock(&text);
        let restored = locked.restore(&locked.text);
        prop_assert!(!restored.contains("SCI"));
        prop_assert!(!restored.to_lowercase().contains("energy"));
        prop_assert!(restored.contains("database") == text.contains("database"));
    }
}
