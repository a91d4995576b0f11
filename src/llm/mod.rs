//! Chat-completion adapter with provider + model routing.
//!
//! One logical model name maps to a provider-specific identifier per
//! provider; a failed call against the primary provider retries exactly once
//! against OpenAI when fallback is enabled and a credential exists.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::error::PipelineError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Anthropic => f.write_str("anthropic"),
            Provider::OpenAi => f.write_str("openai"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub provider: Provider,
}

#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, PipelineError>;
}

// ── Model routing ──────────────────────────────────────────────────────────

struct ModelRoute {
    name: &'static str,
    anthropic: Option<&'static str>,
    openai: Option<&'static str>,
}

const MODEL_ROUTES: &[ModelRoute] = &[
    ModelRoute {
        name: "claude-sonnet-4",
        anthropic: Some("claude-sonnet-4-20250514"),
        openai: Some("gpt-4o"),
    },
    ModelRoute {
        name: "claude-haiku-3.5",
        anthropic: Some("claude-3-5-haiku-20241022"),
        openai: Some("gpt-4o-mini"),
    },
    ModelRoute {
        name: "gpt-4o",
        anthropic: None,
        openai: Some("gpt-4o"),
    },
    ModelRoute {
        name: "gpt-4o-mini",
        anthropic: None,
        openai: Some("gpt-4o-mini"),
    },
    ModelRoute {
        name: "o3-mini",
        anthropic: None,
        openai: Some("o3-mini"),
    },
];

/// Map a logical model name to the provider's identifier.
///
/// Unrecognized names pass through untouched so new models work without a
/// table change.
fn resolve_model(logical: &str, provider: Provider) -> String {
    for route in MODEL_ROUTES {
        if route.name == logical {
            let resolved = match provider {
                Provider::Anthropic => route.anthropic,
                Provider::OpenAi => route.openai,
            };
            if let Some(id) = resolved {
                return id.to_string();
            }
        }
    }
    logical.to_string()
}

/// Reasoning-family models reject any non-default temperature; the parameter
/// must be omitted entirely for them.
fn rejects_temperature(model_id: &str) -> bool {
    const PREFIXES: [&str; 4] = ["o1", "o3", "o4", "gpt-5"];
    PREFIXES.iter().any(|p| model_id.starts_with(p))
}

// ── Client ─────────────────────────────────────────────────────────────────

pub struct LlmClient {
    client: reqwest::Client,
    primary: Provider,
    openai_api_key: Option<String>,
    anthropic_api_key: Option<String>,
    fallback_to_openai: bool,
}

impl LlmClient {
    pub fn new(
        primary: Provider,
        openai_api_key: Option<String>,
        anthropic_api_key: Option<String>,
        fallback_to_openai: bool,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            primary,
            openai_api_key,
            anthropic_api_key,
            fallback_to_openai,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let primary = match config.llm_provider.as_str() {
            "openai" => Provider::OpenAi,
            _ => Provider::Anthropic,
        };
        Self::new(
            primary,
            config.openai_api_key.clone(),
            config.anthropic_api_key.clone(),
            config.llm_fallback_to_openai,
        )
    }

    async fn complete_with(
        &self,
        provider: Provider,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, PipelineError> {
        match provider {
            Provider::OpenAi => self.complete_openai(request).await,
            Provider::Anthropic => self.complete_anthropic(request).await,
        }
    }

    async fn complete_openai(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, PipelineError> {
        let api_key = self
            .openai_api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Unavailable("OPENAI_API_KEY not set".into()))?;
        let model = resolve_model(&request.model, Provider::OpenAi);
        let temperature = if rejects_temperature(&model) {
            None
        } else {
            request.temperature
        };

        let body = OpenAiRequest {
            model: &model,
            messages: &request.messages,
            temperature,
            max_tokens: request.max_tokens,
        };

        log::debug!("LLM request: provider=openai model={}", model);
        let response = self
            .client
            .post(format!("{OPENAI_BASE_URL}/chat/completions"))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: OpenAiResponse = response.json().await.map_err(|e| {
            PipelineError::Parse(format!("openai response: {e}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::NoContent("openai returned no choices".into()))?;

        Ok(CompletionResponse {
            content,
            model: parsed.model,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
            },
            provider: Provider::OpenAi,
        })
    }

    async fn complete_anthropic(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, PipelineError> {
        let api_key = self
            .anthropic_api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Unavailable("ANTHROPIC_API_KEY not set".into()))?;
        let model = resolve_model(&request.model, Provider::Anthropic);

        // Anthropic takes system text out of band
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<AnthropicMessage<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                content: &m.content,
            })
            .collect();

        let body = AnthropicRequest {
            model: &model,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            messages: turns,
            temperature: request.temperature,
        };

        log::debug!("LLM request: provider=anthropic model={}", model);
        let response = self
            .client
            .post(format!("{ANTHROPIC_BASE_URL}/messages"))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: AnthropicResponse = response.json().await.map_err(|e| {
            PipelineError::Parse(format!("anthropic response: {e}"))
        })?;
        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(PipelineError::NoContent(
                "anthropic returned no text blocks".into(),
            ));
        }

        Ok(CompletionResponse {
            content,
            model: parsed.model,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
            provider: Provider::Anthropic,
        })
    }
}

#[async_trait]
impl ChatCompleter for LlmClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, PipelineError> {
        match self.complete_with(self.primary, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let can_fall_back = self.fallback_to_openai
                    && self.primary != Provider::OpenAi
                    && self.openai_api_key.is_some();
                if !can_fall_back {
                    return Err(e);
                }
                log::warn!(
                    "LLM call to {} failed ({}), retrying once against openai",
                    self.primary,
                    e
                );
                self.complete_with(Provider::OpenAi, request).await
            }
        }
    }
}

// ── JSON extraction ────────────────────────────────────────────────────────

/// Extract the JSON body from an LLM reply.
///
/// Prefers the contents of the first triple-backtick block (optionally tagged
/// `json`); otherwise the raw body is treated as JSON, with a brace-scan
/// rescue for replies that wrap the object in prose.
pub fn extract_json(response: &str) -> Result<serde_json::Value, PipelineError> {
    let trimmed = response.trim();

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Ok(value);
        }
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(start) = trimmed.find('{') {
        let mut depth = 0usize;
        for (i, c) in trimmed[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &trimmed[start..start + i + 1];
                        if let Ok(value) = serde_json::from_str(candidate) {
                            return Ok(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    Err(PipelineError::Parse(format!(
        "no JSON found in response ({} chars)",
        response.len()
    )))
}

/// Typed variant of [`extract_json`].
pub fn parse_json_response<T: DeserializeOwned>(response: &str) -> Result<T, PipelineError> {
    let value = extract_json(response)?;
    serde_json::from_value(value).map_err(|e| PipelineError::Parse(e.to_string()))
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an optional language tag on the fence line
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

// ── Provider wire types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
