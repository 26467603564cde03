//! Generation backends.
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `disabled` | [`DisabledGenerator`], always fails |
//! | `extractive` | [`ExtractiveGenerator`], offline; quotes the top passage |
//! | `openai` | `POST {url}/v1/chat/completions` |
//! | `ollama` | `POST {url}/api/chat` |
//!
//! HTTP backends make one request per call. [`RetryingGenerator`] adds
//! bounded retries of transient failures on top.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use docent_core::generation::GenerationProvider;
use docent_core::prompt::{
    PromptMessage, PromptSections, INSUFFICIENT_CONTEXT_REPLY, KNOWLEDGE_BASE_DISABLED_REPLY,
};

use crate::config::GenerationConfig;
use crate::retry::{send_error, status_error, with_retry, RetryPolicy};

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &PromptSections) -> Result<String> {
        bail!("Generation provider is disabled; set [generation] provider in the config")
    }
}

/// Answers from the passages without a language model.
///
/// Replies with the opening of the highest-ranked passage and cites it,
/// or with the refusal sentence when there is nothing to quote.
pub struct ExtractiveGenerator {
    max_chars: usize,
}

impl ExtractiveGenerator {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self::new(400)
    }
}

#[async_trait]
impl GenerationProvider for ExtractiveGenerator {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, prompt: &PromptSections) -> Result<String> {
        if !prompt.use_knowledge_base {
            return Ok(KNOWLEDGE_BASE_DISABLED_REPLY.to_string());
        }
        let Some(top) = prompt.passages.first() else {
            return Ok(INSUFFICIENT_CONTEXT_REPLY.to_string());
        };
        let excerpt: String = top.text.chars().take(self.max_chars).collect();
        let ellipsis = if top.text.chars().count() > self.max_chars {
            "..."
        } else {
            ""
        };
        Ok(format!(
            "{}{} [Source {}]",
            excerpt.trim(),
            ellipsis,
            top.number
        ))
    }
}

fn role_messages(prompt: &PromptSections) -> Vec<serde_json::Value> {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": prompt.system,
    })];
    messages.extend(prompt.messages().iter().map(|PromptMessage { role, content }| {
        serde_json::json!({ "role": role.as_str(), "content": content })
    }));
    messages
}

/// OpenAI-compatible chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &PromptSections) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": role_messages(prompt),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("OpenAI", e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, &text));
        }
        let json: serde_json::Value = response.json().await?;
        parse_openai_reply(&json)
    }
}

fn parse_openai_reply(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

/// Ollama `/api/chat` with streaming off.
pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    max_tokens: u32,
    temperature: f32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &PromptSections) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": role_messages(prompt),
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error("Ollama", e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("Ollama", status, &text));
        }
        let json: serde_json::Value = response.json().await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message.content"))
    }
}

/// Wraps a generator with bounded exponential backoff.
pub struct RetryingGenerator {
    inner: Box<dyn GenerationProvider>,
    retry: RetryPolicy,
}

impl RetryingGenerator {
    pub fn new(inner: Box<dyn GenerationProvider>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl GenerationProvider for RetryingGenerator {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate(&self, prompt: &PromptSections) -> Result<String> {
        with_retry(self.retry, "generation", || self.inner.generate(prompt)).await
    }
}

/// Build the configured generator, wrapped for retries.
pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn GenerationProvider>> {
    let inner: Box<dyn GenerationProvider> = match config.provider.as_str() {
        "disabled" => Box::new(DisabledGenerator),
        "extractive" => Box::new(ExtractiveGenerator::default()),
        "openai" => Box::new(OpenAIGenerator::new(config)?),
        "ollama" => Box::new(OllamaGenerator::new(config)?),
        other => bail!("Unknown generation provider: {}", other),
    };
    Ok(Box::new(RetryingGenerator::new(
        inner,
        RetryPolicy::new(config.max_retries, config.initial_backoff_ms),
    )))
}
