//! Error types for the Docent core library.
//!
//! Uses `thiserror` for public API error types. Provider failures carry
//! enough structure to be classified as transient (retry, then fall back)
//! or terminal (surface immediately).

use std::path::PathBuf;

/// Top-level error type for the Docent core library.
#[derive(Debug, thiserror::Error)]
pub enum DocentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse failure taxonomy used for retry and fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or a request the provider will never accept as-is.
    Validation,
    /// Timeouts, dropped connections, 5xx. Safe to retry.
    Transient,
    /// 401/403/429. Never retried.
    AuthQuota,
}

/// Errors from any external collaborator: completion, embedding, vector
/// backend, document store, or chat history.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Access forbidden for provider {provider}")]
    Forbidden { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request rejected ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Context window exceeded: used {used} of {limit} tokens")]
    ContextOverflow { used: usize, limit: usize },

    #[error("Circuit open for provider {provider}")]
    CircuitOpen { provider: String },
}

impl ProviderError {
    /// Classify this error for retry/fallback purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::AuthFailed { .. }
            | ProviderError::Forbidden { .. }
            | ProviderError::RateLimited { .. } => ErrorClass::AuthQuota,
            ProviderError::Timeout { .. }
            | ProviderError::Connection { .. }
            | ProviderError::ServerError { .. }
            | ProviderError::Streaming { .. }
            | ProviderError::CircuitOpen { .. } => ErrorClass::Transient,
            ProviderError::ClientError { .. }
            | ProviderError::ResponseParse { .. }
            | ProviderError::ContextOverflow { .. } => ErrorClass::Validation,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map an HTTP status code and body to a provider error.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        match status {
            401 => ProviderError::AuthFailed {
                provider: provider.to_string(),
            },
            403 => ProviderError::Forbidden {
                provider: provider.to_string(),
            },
            429 => ProviderError::RateLimited {
                retry_after_secs: parse_retry_after(body).unwrap_or(5),
            },
            s if s >= 500 => ProviderError::ServerError {
                status: s,
                message: truncate_body(body),
            },
            s => ProviderError::ClientError {
                status: s,
                message: truncate_body(body),
            },
        }
    }
}

/// Pull a "try again in Ns" hint out of a rate-limit body.
fn parse_retry_after(body: &str) -> Option<u64> {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(String::from))?;
    message
        .split("in ")
        .last()
        .and_then(|s| s.trim_end_matches(['s', '.']).trim().parse::<u64>().ok())
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the translation collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslationError {
    #[error("Translator process error: {message}")]
    Process { message: String },

    #[error("Translator protocol error: {message}")]
    Protocol { message: String },

    #[error("Translation failed: {message}")]
    Failed { message: String },

    #[error("Translator channel closed")]
    Closed,
}

/// A type alias for results using the top-level `DocentError`.
pub type Result<T> = std::result::Result<T, DocentError>;
