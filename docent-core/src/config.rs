//! Configuration system for Docent.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/docent/config.toml` and/or `.docent/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::strategy::MAX_SHRINK_PASSES;

/// Top-level configuration for the query pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocentConfig {
    pub classifier: ClassifierConfig,
    pub retrieval: RetrievalConfig,
    pub strategy: StrategyConfig,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub history: HistoryConfig,
    pub providers: ProvidersConfig,
    pub translation: TranslationConfig,
}

/// Query gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum query length in characters, after trimming.
    pub min_chars: usize,
    /// Maximum query length in characters, after trimming.
    pub max_chars: usize,
    /// Ask the classifier model before falling back to heuristics.
    pub use_model: bool,
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_chars: 2,
            max_chars: 2000,
            use_model: true,
            timeout_ms: 5_000,
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retrieval and ranking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Share of the top results one document must hold to trigger a
    /// narrowed re-query.
    pub dominance_threshold: f32,
    /// Minimum similarity (`1 - distance`) a chunk must reach.
    pub min_score: f32,
    /// Chunks in this language are kept regardless of the query language.
    pub base_language: String,
    /// Retries after the first attempt for embedding, vector, and store calls.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dominance_threshold: 0.6,
            min_score: 0.4,
            base_language: "en".to_string(),
            max_retries: 2,
            retry_backoff_ms: 200,
            call_timeout_ms: 10_000,
        }
    }
}

/// Context strategy and token budget settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Corpora at or under this many pages are sent whole.
    pub full_document_page_limit: usize,
    pub context_window: usize,
    pub safety_margin: usize,
    pub min_output_tokens: usize,
    pub max_output_tokens: usize,
    pub max_shrink_passes: u8,
    pub max_sub_queries: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            full_document_page_limit: 50,
            context_window: 128_000,
            safety_margin: 500,
            min_output_tokens: 100,
            max_output_tokens: 8_000,
            max_shrink_passes: 2,
            max_sub_queries: 4,
        }
    }
}

/// Model invocation settings: timeouts, retries, breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub timeout_secs: u64,
    /// Consecutive primary failures before the breaker opens.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub temperature: f32,
    /// Number of recent model attempts kept for inspection.
    pub attempt_window: usize,
    /// Bytes of rendered context that contribute to the answer cache key.
    pub cache_context_prefix_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            failure_threshold: 5,
            cooldown_secs: 60,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 32_000,
            temperature: 0.3,
            attempt_window: 64,
            cache_context_prefix_bytes: 4_096,
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Cache lifetimes and capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub embedding_ttl_secs: u64,
    pub answer_ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_ttl_secs: 24 * 60 * 60,
            answer_ttl_secs: 30 * 60,
            max_entries: 10_000,
        }
    }
}

/// Chat history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Number of most recent turns included in prompts.
    pub window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { window: 6 }
    }
}

/// Translation subprocess settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Program and arguments of the JSON-lines translator; empty disables translation.
    pub command: Vec<String>,
    pub reply_timeout_secs: u64,
    /// Lock scientific terms before English to Hindi translation.
    pub glossary: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            reply_timeout_secs: 120,
            glossary: true,
        }
    }
}

impl TranslationConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// Endpoint settings for one completion provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name reported in `provider_used` and logs.
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub context_window: usize,
}

impl ProviderConfig {
    fn openai(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            context_window: 128_000,
        }
    }

    /// Resolve the API key, preferring an inline value over the environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        std::env::var(&self.api_key_env).map_err(|_| ConfigError::EnvVarMissing {
            var: self.api_key_env.clone(),
        })
    }
}

/// Embedding backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` for the hash embedder, `"openai"` for an OpenAI-compatible endpoint.
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub base_url: String,
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 256,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// All external model endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub primary: ProviderConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ProviderConfig>,
    /// Fast model used by the query gate. Defaults to the primary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier: Option<ProviderConfig>,
    pub embedding: EmbeddingConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary: ProviderConfig::openai("primary", "gpt-4o"),
            fallback: Some(ProviderConfig::openai("fallback", "gpt-4o-mini")),
            classifier: None,
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl DocentConfig {
    /// Reject settings that would make the token budget or gate unsatisfiable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });
        let s = &self.strategy;
        if s.min_output_tokens > s.max_output_tokens {
            return invalid(format!(
                "strategy.min_output_tokens ({}) exceeds strategy.max_output_tokens ({})",
                s.min_output_tokens, s.max_output_tokens
            ));
        }
        // Leave room for at least a minimal prompt.
        let floor = s.safety_margin + s.min_output_tokens + 2_048;
        if s.context_window < floor {
            return invalid(format!(
                "strategy.context_window ({}) must be at least {floor}",
                s.context_window
            ));
        }
        if !(2..=4).contains(&s.max_sub_queries) {
            return invalid(format!(
                "strategy.max_sub_queries must be between 2 and 4, got {}",
                s.max_sub_queries
            ));
        }
        if s.max_shrink_passes > MAX_SHRINK_PASSES {
            return invalid(format!(
                "strategy.max_shrink_passes must be at most {MAX_SHRINK_PASSES}, got {}",
                s.max_shrink_passes
            ));
        }
        let r = &self.retrieval;
        if !(r.dominance_threshold > 0.0 && r.dominance_threshold <= 1.0) {
            return invalid(format!(
                "retrieval.dominance_threshold must be in (0, 1], got {}",
                r.dominance_threshold
            ));
        }
        if !(0.0..=1.0).contains(&r.min_score) {
            return invalid(format!(
                "retrieval.min_score must be in [0, 1], got {}",
                r.min_score
            ));
        }
        if self.classifier.min_chars > self.classifier.max_chars {
            return invalid("classifier.min_chars exceeds classifier.max_chars".to_string());
        }
        let o = &self.orchestrator;
        if o.failure_threshold == 0 {
            return invalid("orchestrator.failure_threshold must be at least 1".to_string());
        }
        if o.max_attempts == 0 {
            return invalid("orchestrator.max_attempts must be at least 1".to_string());
        }
        if self.translation.reply_timeout_secs == 0 {
            return invalid("translation.reply_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DOCENT_`)
/// 3. Workspace-local config (`.docent/config.toml`)
/// 4. User config (`~/.config/docent/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DocentConfig>,
) -> Result<DocentConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DocentConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "docent", "docent") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".docent").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DOCENT_RETRIEVAL__MIN_SCORE, DOCENT_ORCHESTRATOR__TIMEOUT_SECS, ...
    figment = figment.merge(Env::prefixed("DOCENT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "docent", "docent")
        && config_dir.config_dir().join("config.toml").exists()
    {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(".docent").join("config.toml").exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DocentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.dominance_threshold, 0.6);
        assert_eq!(config.strategy.full_document_page_limit, 50);
        assert_eq!(config.orchestrator.failure_threshold, 5);
        assert_eq!(config.cache.answer_ttl_secs, 1800);
        assert_eq!(config.history.window, 6);
        assert!(config.translation.command.is_empty());
        assert!(config.translation.glossary);
    }

    #[test]
    fn test_validate_rejects_inverted_output_bounds() {
        let mut config = DocentConfig::default();
        config.strategy.min_output_tokens = 9_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_output_tokens"));
    }

    #[test]
    fn test_validate_rejects_tiny_window() {
        let mut config = DocentConfig::default();
        config.strategy.context_window = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_excess_shrink_passes() {
        let mut config = DocentConfig::default();
        config.strategy.max_shrink_passes = 70;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_shrink_passes"));
        config.strategy.max_shrink_passes = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_dominance() {
        let mut config = DocentConfig::default();
        config.retrieval.dominance_threshold = 0.0;
        assert!(config.validate().is_err());
        config.retrieval.dominance_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_section_keeps_defaults() {
        let config: DocentConfig = toml::from_str(
            r#"
[retrieval]
min_score = 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.retrieval.min_score, 0.5);
        assert_eq!(config.retrieval.dominance_threshold, 0.6);
        assert_eq!(config.strategy.context_window, 128_000);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.classifier.max_chars, 2000);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = DocentConfig::default();
        overrides.orchestrator.timeout_secs = 10;
        overrides.history.window = 4;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.orchestrator.timeout_secs, 10);
        assert_eq!(config.history.window, 4);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let docent_dir = dir.path().join(".docent");
        std::fs::create_dir_all(&docent_dir).unwrap();
        std::fs::write(
            docent_dir.join("config.toml"),
            r#"
[strategy]
full_document_page_limit = 20

[providers.primary]
name = "local-llm"
base_url = "http://localhost:8080/v1"
model = "llama-3"
api_key_env = "LOCAL_KEY"
context_window = 32000
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.strategy.full_document_page_limit, 20);
        assert_eq!(config.providers.primary.model, "llama-3");
        assert_eq!(config.providers.primary.context_window, 32_000);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_resolve_api_key_prefers_inline() {
        let mut provider = ProviderConfig::openai("p", "m");
        provider.api_key_env = "DOCENT_TEST_KEY_THAT_IS_NEVER_SET".into();
        assert!(matches!(
            provider.resolve_api_key(),
            Err(ConfigError::EnvVarMissing { .. })
        ));
        provider.api_key = Some("sk-inline".into());
        assert_eq!(provider.resolve_api_key().unwrap(), "sk-inline");
    }
}
