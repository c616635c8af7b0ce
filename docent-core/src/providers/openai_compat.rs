//! OpenAI-compatible completion and embedding provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any
//! endpoint that follows the OpenAI chat completions API format.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use super::{CompletionOptions, CompletionProvider, EmbeddingProvider, StreamEvent};
use crate::config::{EmbeddingConfig, ProviderConfig};
use crate::error::ProviderError;

/// OpenAI-compatible chat completions provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    context_window: usize,
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("localhost") || base_url.contains("127.0.0.1")
}

fn send_error(e: reqwest::Error, timeout_ms: u64) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { timeout_ms }
    } else {
        ProviderError::Connection {
            message: e.to_string(),
        }
    }
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// Local endpoints (localhost, 127.0.0.1) don't require an API key.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = match config.resolve_api_key() {
            Ok(key) => key,
            Err(_) if is_local(&config.base_url) => {
                debug!("No API key set for local provider; using dummy bearer token");
                "local".to_string()
            }
            Err(_) => {
                return Err(ProviderError::AuthFailed {
                    provider: format!("{}: env var '{}' not set", config.name, config.api_key_env),
                });
            }
        };
        Ok(Self {
            client: Client::new(),
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            context_window: config.context_window,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, prompt: &str, options: &CompletionOptions, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(e, 0))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&self.name, status.as_u16(), &text));
        }
        Ok(response)
    }

    /// Extract the assistant message text from a non-streaming response.
    fn parse_completion(body: &Value) -> Result<String, ProviderError> {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::ResponseParse {
                message: "missing choices[0].message.content".to_string(),
            })
    }

    /// Parse a single SSE data line. Returns the parsed JSON if valid.
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line.strip_prefix("data: ")?;
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    fn delta_content(data: &Value) -> Option<&str> {
        data.get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let response = self.post(&self.request_body(prompt, options, false)).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;
        Self::parse_completion(&body)
    }

    async fn classify(&self, prompt: &str) -> Result<Value, ProviderError> {
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 256,
        };
        let mut body = self.request_body(prompt, &options, false);
        body["response_format"] = json!({ "type": "json_object" });
        let response = self.post(&body).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;
        super::extract_json_object(&Self::parse_completion(&body)?)
    }

    async fn complete_streaming(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let response = self.post(&self.request_body(prompt, options, true)).await?;
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Streaming {
                message: format!("Failed to read stream: {e}"),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" {
                    let _ = tx.send(StreamEvent::Done).await;
                    return Ok(());
                }
                if let Some(data) = Self::parse_sse_line(line)
                    && let Some(token) = Self::delta_content(&data)
                    && tx.send(StreamEvent::Token(token.to_string())).await.is_err()
                {
                    debug!(provider = %self.name, "Stream receiver dropped, stopping");
                    return Ok(());
                }
            }
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }
}

/// OpenAI embeddings endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let api_key =
            std::env::var(&config.api_key_env).map_err(|_| ProviderError::AuthFailed {
                provider: format!("embeddings: env var '{}' not set", config.api_key_env),
            })?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn parse_embedding(body: &Value) -> Result<Vec<f32>, ProviderError> {
        body.get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("embedding"))
            .and_then(|e| e.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| ProviderError::ResponseParse {
                message: "missing data[0].embedding".to_string(),
            })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| send_error(e, 0))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("embeddings", status.as_u16(), &text));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;
        Self::parse_embedding(&body)
    }
}
