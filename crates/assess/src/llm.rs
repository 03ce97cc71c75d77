use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::error::InvocationError;
use crate::prompt::ChatMessage;

static RETRY_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:try again in|retry after)\s+([0-9]+(?:\.[0-9]+)?)\s*(ms|s|seconds?)?").unwrap()
});

/// Raw text of a model reply plus reported token usage.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub content: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    /// Attempts it took to obtain this reply.
    pub attempts: usize,
}

impl RawResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            prompt_tokens: None,
            completion_tokens: None,
            attempts: 1,
        }
    }
}

/// One chat completion against a remote model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<RawResponse, InvocationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Ask the endpoint for JSON-only output.
    pub json_mode: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            temperature: 0.0,
            max_output_tokens: 2048,
            json_mode: true,
        }
    }
}

/// Client for the configured provider.
pub fn build_client(config: &ModelConfig) -> Result<Arc<dyn ChatModel>, InvocationError> {
    match config.provider {
        Provider::OpenAi => {
            let key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| InvocationError::Config("an API key is required for the openai provider".to_string()))?;
            Ok(Arc::new(OpenAiClient::new(config.clone(), key)))
        }
        Provider::Ollama => Ok(Arc::new(OllamaClient::new(config.base_url.clone(), config.model.clone()))),
    }
}

/// Wait hint from a `Retry-After` header (seconds or HTTP date) or the error body.
pub fn retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after_header)
        .or_else(|| retry_after_from_body(body))
}

fn parse_retry_after_header(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        // Rejects negative, non-finite and overflowing values.
        return Duration::try_from_secs_f64(secs).ok();
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

pub fn retry_after_from_body(body: &str) -> Option<Duration> {
    let caps = RETRY_HINT.captures(body)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let secs = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "ms" => value / 1000.0,
        _ => value,
    };
    Duration::try_from_secs_f64(secs).ok()
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InvocationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(InvocationError::from_status(status.as_u16(), retry_after(&headers, &body), &body))
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct OpenAiClient {
    config: ModelConfig,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig, api_key: String) -> Self {
        Self {
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<RawResponse, InvocationError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let request = OpenAiRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_output_tokens,
            response_format: self.config.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: OpenAiResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InvocationError::InvalidResponse("reply has no message content".to_string()))?;

        Ok(RawResponse {
            content,
            prompt_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
            attempts: 1,
        })
    }
}

/// Local Ollama `/api/chat` client.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    format: &'static str, // "json" for structured output
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new("http://localhost:11434".to_string(), "llama3".to_string())
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<RawResponse, InvocationError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let request = OllamaRequest {
            model: &self.model,
            messages,
            stream: false,
            format: "json", // Force JSON output
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;
        let body: OllamaResponse = response.json().await?;

        Ok(RawResponse {
            content: body.message.content,
            prompt_tokens: body.prompt_eval_count,
            completion_tokens: body.eval_count,
            attempts: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_header_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers, ""), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_header_in_the_past_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers, ""), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_from_error_body() {
        let body = r#"{"error":{"message":"Rate limit reached for gpt-4o. Please try again in 1.5s."}}"#;
        assert_eq!(retry_after(&HeaderMap::new(), body), Some(Duration::from_millis(1500)));
        assert_eq!(retry_after_from_body("Retry after 250ms"), Some(Duration::from_millis(250)));
        assert_eq!(retry_after_from_body("quota exceeded"), None);
    }

    #[test]
    fn unusable_wait_hints_are_ignored() {
        for value in ["inf", "NaN", "-3", "1e300"] {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
            assert_eq!(retry_after(&headers, ""), None, "header {value}");
        }
        assert_eq!(retry_after_from_body("Please try again in 99999999999999999999999 s"), None);

        let hint = retry_after(&HeaderMap::new(), "try again in 99999999999999999999999 s");
        let err = InvocationError::from_status(429, hint, "slow down");
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn openai_requires_api_key() {
        let config = ModelConfig::default();
        assert!(matches!(build_client(&config), Err(InvocationError::Config(_))));

        let config = ModelConfig {
            api_key: Some("sk-test".to_string()),
            ..ModelConfig::default()
        };
        assert_eq!(build_client(&config).unwrap().name(), "gpt-4o");
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = ModelConfig {
            provider: Provider::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            ..ModelConfig::default()
        };
        assert_eq!(build_client(&config).unwrap().name(), "llama3");
    }

    #[test]
    fn openai_request_shape() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let request = OpenAiRequest {
            model: "gpt-4o",
            messages: &messages,
            temperature: 0.0,
            max_tokens: 100,
            response_format: Some(ResponseFormat { kind: "json_object" }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["response_format"]["type"], "json_object");
    }
}
