use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chatlabel_core::ChatModel;
use reqwest::{header::HeaderValue, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

const MAX_RETRIES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Ollama => "ollama",
            LlmProvider::Local => "local",
        }
    }

    /// Whether the provider can be asked for a JSON-schema constrained answer.
    /// The offline stub honors a schema by declining.
    pub fn supports_structured_output(&self) -> bool {
        matches!(
            self,
            LlmProvider::OpenAi | LlmProvider::Ollama | LlmProvider::Local
        )
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "ollama" => Ok(LlmProvider::Ollama),
            "local" => Ok(LlmProvider::Local),
            other => Err(anyhow!("unknown llm provider {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
    /// JSON schema the answer must follow, for providers that support it.
    pub response_schema: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    OpenAi(OpenAiConfig),
    Anthropic(AnthropicConfig),
    Ollama(OllamaConfig),
    Local,
}

#[derive(Clone)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
}

#[derive(Clone)]
struct AnthropicConfig {
    api_key: String,
    max_tokens: u32,
}

#[derive(Clone)]
struct OllamaConfig {
    host: String,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let http = Client::new();
        let config = match provider {
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Anthropic => ProviderConfig::Anthropic(AnthropicConfig {
                api_key: read_api_key("ANTHROPIC_API_KEY")?,
                max_tokens: env::var("ANTHROPIC_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1024),
            }),
            LlmProvider::Ollama => ProviderConfig::Ollama(OllamaConfig {
                host: ollama_host(env::var("OLLAMA_HOST").ok().as_deref()),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            config,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn supports_structured_output(&self) -> bool {
        self.provider.supports_structured_output()
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let response = match &self.config {
            ProviderConfig::OpenAi(cfg) => self.chat_openai(cfg, req).await,
            ProviderConfig::Anthropic(cfg) => self.chat_anthropic(cfg, req).await,
            ProviderConfig::Ollama(cfg) => self.chat_ollama(cfg, req).await,
            ProviderConfig::Local => Ok(self.chat_local(req)),
        }?;
        tracing::debug!(
            provider = self.provider.as_str(),
            model = %self.model,
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            "llm call finished"
        );
        Ok(response)
    }

    async fn chat_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": self.model,
            "messages": chat_messages(req),
        });
        if let Some(schema) = &req.response_schema {
            payload["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "judgment", "strict": true, "schema": schema },
            });
        }
        let value = self
            .send_with_retry("openai", || {
                self.http.post(&url).bearer_auth(&cfg.api_key).json(&payload)
            })
            .await?;
        let content = extract_openai_text(&value)
            .ok_or_else(|| anyhow!("missing text in OpenAI response"))?;
        let usage: OpenAiUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    async fn chat_anthropic(&self, cfg: &AnthropicConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": cfg.max_tokens,
            "messages": [ { "role": "user", "content": req.user } ],
        });
        if let Some(system) = &req.system {
            payload["system"] = json!(system);
        }
        let value = self
            .send_with_retry("anthropic", || {
                self.http
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", &cfg.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&payload)
            })
            .await?;
        let response: AnthropicResponse =
            serde_json::from_value(value).context("failed to decode anthropic response")?;
        let text = response
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("missing text in Anthropic response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
        })
    }

    async fn chat_ollama(&self, cfg: &OllamaConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/chat", cfg.host);
        let mut payload = json!({
            "model": self.model,
            "messages": chat_messages(req),
            "stream": false,
        });
        if let Some(schema) = &req.response_schema {
            payload["format"] = schema.clone();
        }
        let value = self
            .send_with_retry("ollama", || self.http.post(&url).json(&payload))
            .await?;
        let response: OllamaResponse =
            serde_json::from_value(value).context("failed to decode ollama response")?;
        Ok(LlmResponse {
            content: response.message.content,
            prompt_tokens: response.prompt_eval_count.unwrap_or(0),
            completion_tokens: response.eval_count.unwrap_or(0),
        })
    }

    fn chat_local(&self, req: &LlmRequest) -> LlmResponse {
        let content = if req.response_schema.is_some() {
            json!({ "result": false }).to_string()
        } else {
            summarize_text(&req.user, 40)
        };
        LlmResponse {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// Sends the request built by `build`, retrying transport errors and
    /// 429 responses with exponential backoff.
    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match build().send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > MAX_RETRIES {
                        return Err(err).with_context(|| format!("{label} request failed"));
                    }
                    tracing::debug!(attempt, "{label} request failed, retrying: {err}");
                    sleep(backoff_delay(attempt, None)).await;
                    continue;
                }
            };
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt > MAX_RETRIES {
                    return Err(anyhow!("{label} rate limited after {MAX_RETRIES} retries"));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                tracing::debug!(attempt, wait_secs = wait.as_secs(), "{label} rate limited");
                sleep(wait).await;
                continue;
            }
            return decode_body(label, response).await;
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, instruction: &str, content: &str) -> Result<String> {
        let request = LlmRequest {
            system: Some(instruction.to_string()),
            user: content.to_string(),
            response_schema: None,
        };
        Ok(self.chat(&request).await?.content)
    }
}

fn chat_messages(req: &LlmRequest) -> Vec<Value> {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": req.user }));
    messages
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(text) = value.to_str() {
            if let Ok(secs) = text.parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    let capped = attempt.min(6) as u32;
    Duration::from_secs(1u64 << capped)
}

fn ollama_host(value: Option<&str>) -> String {
    let host = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("localhost:11434");
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

async fn decode_body(label: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("{label} returned error (status {status}): {body}"));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to decode {label} response"))
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    text.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .flat_map(|line| line.split_whitespace())
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!("{var} is not set"))?;
    validate_api_key(var, &value)?;
    Ok(value)
}

fn validate_api_key(var: &str, value: &str) -> Result<()> {
    if var.contains("OPENAI") && !value.starts_with("sk-") {
        return Err(anyhow!(
            "{var} must start with 'sk-' (see https://platform.openai.com/)"
        ));
    }
    if var.contains("ANTHROPIC") && !value.starts_with("sk-ant-") {
        return Err(anyhow!("{var} must start with 'sk-ant-'"));
    }
    Ok(())
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}
