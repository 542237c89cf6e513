//! Live generation backends.
//!
//! Both backends send one HTTP request per [`GenerationRequest`] and do not
//! retry; the answer synthesizer owns the retry policy. Any transport error,
//! non-success status or malformed body becomes
//! [`EngineError::GenerationUnavailable`].

use anyhow::{bail, Result as AnyResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::generation::Generator;
use hybrid_query_core::prompt::{GenerationPurpose, GenerationRequest};

use crate::config::GenerationConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

fn unavailable(msg: impl std::fmt::Display) -> EngineError {
    EngineError::GenerationUnavailable(msg.to_string())
}

/// System prompt followed by the request's conversation messages.
fn chat_messages(request: &GenerationRequest) -> Vec<serde_json::Value> {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": request.system,
    })];
    messages.extend(request.messages.iter().map(|m| {
        serde_json::json!({
            "role": m.role.to_string(),
            "content": m.content,
        })
    }));
    messages
}

/// Shared request settings. SQL generation keeps the request's own
/// temperature; answers use the configured one.
#[derive(Debug, Clone)]
struct Sampling {
    temperature: f32,
    max_tokens: u32,
}

impl Sampling {
    fn for_request(&self, request: &GenerationRequest) -> (f32, u32) {
        let temperature = match request.purpose {
            GenerationPurpose::Sql => request.constraints.temperature,
            GenerationPurpose::Answer => self.temperature,
        };
        (temperature, request.constraints.max_tokens.min(self.max_tokens))
    }
}

fn client(timeout_secs: u64) -> AnyResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn send(request: reqwest::RequestBuilder, backend: &str) -> Result<serde_json::Value> {
    let response = request
        .send()
        .await
        .map_err(|e| unavailable(format!("{} connection error: {}", backend, e)))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(unavailable(format!("{} API error {}: {}", backend, status, body)));
    }
    response
        .json()
        .await
        .map_err(|e| unavailable(format!("{} response: {}", backend, e)))
}

// ============ OpenAI-compatible chat completions ============

/// Chat completions against OpenAI or any compatible endpoint (Groq, vLLM, ...).
pub struct OpenAiGenerator {
    model: String,
    url: String,
    api_key: String,
    sampling: Sampling,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    /// Create a generator, reading the key from `generation.api_key_env`.
    pub fn new(config: &GenerationConfig) -> AnyResult<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &GenerationConfig, api_key: impl Into<String>) -> AnyResult<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            sampling: Sampling {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            client: client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let (temperature, max_tokens) = self.sampling.for_request(request);
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request),
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if !request.constraints.stop.is_empty() {
            body["stop"] = serde_json::json!(request.constraints.stop);
        }

        let json = send(
            self.client
                .post(format!("{}/chat/completions", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body),
            "OpenAI",
        )
        .await?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| unavailable("Invalid chat response: missing choices[0].message.content"))
    }
}

// ============ Ollama chat ============

pub struct OllamaGenerator {
    model: String,
    url: String,
    sampling: Sampling,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> AnyResult<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            sampling: Sampling {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            client: client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let (temperature, max_tokens) = self.sampling.for_request(request);
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request),
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
                "stop": request.constraints.stop,
            },
        });

        let json = send(
            self.client.post(format!("{}/api/chat", self.url)).json(&body),
            "Ollama",
        )
        .await?;

        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| unavailable("Invalid Ollama response: missing message.content"))
    }
}

/// Create the [`Generator`] named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> AnyResult<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybrid_query_core::models::QueryTurn;
    use hybrid_query_core::prompt::answer_request;

    fn config() -> GenerationConfig {
        GenerationConfig {
            provider: "ollama".into(),
            model: "llama3".into(),
            url: None,
            api_key_env: "HQ_TEST_UNSET_KEY".into(),
            temperature: 0.3,
            max_tokens: 256,
            timeout_secs: 5,
            retry_backoff_ms: 10,
        }
    }

    #[test]
    fn test_chat_messages_start_with_system() {
        let history = vec![QueryTurn::user("hi"), QueryTurn::assistant("hello")];
        let req = answer_request("what now?", &[], &history);
        let messages = chat_messages(&req);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "what now?");
    }

    #[test]
    fn test_sampling_caps_max_tokens() {
        let sampling = Sampling {
            temperature: 0.3,
            max_tokens: 256,
        };
        let req = answer_request("q", &[], &[]);
        assert_eq!(sampling.for_request(&req), (0.3, 256));
    }

    #[test]
    fn test_openai_requires_key_env() {
        let mut cfg = config();
        cfg.provider = "openai".into();
        let err = create_generator(&cfg).err().unwrap();
        assert!(err.to_string().contains("HQ_TEST_UNSET_KEY"));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        assert!(create_generator(&config()).is_ok());
    }
}
