//! Summarization collaborator.
//!
//! The orchestrator only sees the [`Summarizer`] trait. Concrete providers are
//! chosen once at startup from credentials in the environment:
//!
//! 1. `ANTHROPIC_API_KEY` - Anthropic Messages API
//! 2. `OPENROUTER_API_KEY` (or an `OPENAI_API_KEY` that is really an
//!    OpenRouter key) - OpenAI-compatible API at OpenRouter
//! 3. `OPENAI_API_KEY` - OpenAI
//!
//! `OPENAI_BASE_URL` overrides the endpoint of the OpenAI-compatible providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::SummaryError;

pub const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_MODEL: &str = "claude-sonnet-4-0";
pub const ANTHROPIC_MAX_TOKENS: u32 = 4096;

pub const OPENAI_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "gpt-4.1";

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
pub const OPENROUTER_MODEL: &str = "openai/gpt-4.1";
const OPENROUTER_KEY_PREFIX: &str = "sk-or-v1-";

const ATTRIBUTION_TITLE: &str = "gradient-engineer";
const ATTRIBUTION_REFERER: &str = "https://gradient.engineer";

/// One diagnostic as handed to the summarizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryPair {
    pub description: String,
    pub output: String,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Provider label for notices and logs
    fn name(&self) -> &str;

    async fn summarize(
        &self,
        instruction: &str,
        pairs: &[SummaryPair],
    ) -> Result<String, SummaryError>;
}

/// `Command <n>: <description>` blocks for every pair with output.
///
/// Numbering follows the full list, so elided pairs leave gaps.
pub fn build_user_content(pairs: &[SummaryPair]) -> String {
    let mut content = String::new();
    for (i, pair) in pairs.iter().enumerate() {
        if pair.output.trim().is_empty() {
            continue;
        }
        content.push_str(&format!("Command {}: {}\n", i + 1, pair.description));
        content.push_str(&pair.output);
        content.push_str("\n\n");
    }
    content
}

fn require_instruction(instruction: &str) -> Result<&str, SummaryError> {
    if instruction.trim().is_empty() {
        Err(SummaryError::MissingInstruction)
    } else {
        Ok(instruction)
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Map a non-2xx response to an API error carrying the body
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SummaryError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    error!("[-]  LLM API error {}: {}", status, body);
    Err(SummaryError::Api { status, body })
}

// ============================================================================
// Provider selection
// ============================================================================

/// Credentials relevant to provider selection
#[derive(Debug, Clone, Default)]
pub struct ProviderEnv {
    pub anthropic_key: Option<String>,
    pub openrouter_key: Option<String>,
    pub openai_key: Option<String>,
    pub openai_base_url: Option<String>,
}

impl ProviderEnv {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            anthropic_key: var("ANTHROPIC_API_KEY"),
            openrouter_key: var("OPENROUTER_API_KEY"),
            openai_key: var("OPENAI_API_KEY"),
            openai_base_url: var("OPENAI_BASE_URL"),
        }
    }

    /// Pick a provider by credential priority; None when no key is set
    pub fn choose(&self) -> Option<ProviderChoice> {
        if let Some(key) = &self.anthropic_key {
            return Some(ProviderChoice::Anthropic {
                api_key: key.clone(),
            });
        }

        let openrouter_key = self.openrouter_key.clone().or_else(|| {
            self.openai_key
                .clone()
                .filter(|k| k.starts_with(OPENROUTER_KEY_PREFIX))
        });

        if let Some(key) = openrouter_key {
            return Some(ProviderChoice::OpenAiCompatible {
                base_url: self
                    .openai_base_url
                    .clone()
                    .unwrap_or_else(|| OPENROUTER_URL.to_string()),
                api_key: key,
                model: OPENROUTER_MODEL.to_string(),
                openrouter: true,
            });
        }

        self.openai_key
            .clone()
            .map(|key| ProviderChoice::OpenAiCompatible {
                base_url: self
                    .openai_base_url
                    .clone()
                    .unwrap_or_else(|| OPENAI_URL.to_string()),
                api_key: key,
                model: OPENAI_MODEL.to_string(),
                openrouter: false,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderChoice {
    Anthropic {
        api_key: String,
    },
    OpenAiCompatible {
        base_url: String,
        api_key: String,
        model: String,
        openrouter: bool,
    },
}

impl ProviderChoice {
    pub fn build(self, timeout: Duration) -> Arc<dyn Summarizer> {
        match self {
            ProviderChoice::Anthropic { api_key } => Arc::new(AnthropicSummarizer::new(
                ANTHROPIC_URL,
                api_key,
                ANTHROPIC_MODEL,
                timeout,
            )),
            ProviderChoice::OpenAiCompatible {
                base_url,
                api_key,
                model,
                openrouter,
            } => {
                let mut client = OpenAiSummarizer::new(base_url, api_key, model, timeout);
                if openrouter {
                    client = client
                        .with_header("X-Title", ATTRIBUTION_TITLE)
                        .with_header("HTTP-Referer", ATTRIBUTION_REFERER);
                }
                Arc::new(client)
            }
        }
    }
}

/// Summarizer for the current environment, if any credentials are present
pub fn summarizer_from_env(timeout: Duration) -> Option<Arc<dyn Summarizer>> {
    let choice = ProviderEnv::from_env().choose();
    match &choice {
        Some(ProviderChoice::Anthropic { .. }) => info!("Summaries via Anthropic"),
        Some(ProviderChoice::OpenAiCompatible {
            base_url, model, ..
        }) => info!("Summaries via {} ({})", base_url, model),
        None => info!("No summarization credentials found"),
    }
    choice.map(|c| c.build(timeout))
}

// ============================================================================
// OpenAI-compatible chat completions
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_choice(response: ChatResponse) -> Result<String, SummaryError> {
    response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or(SummaryError::NoChoicesReturned)
}

pub struct OpenAiSummarizer {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    headers: Vec<(&'static str, String)>,
}

impl OpenAiSummarizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client: http_client(timeout),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn name(&self) -> &str {
        "openai"
    }

    async fn summarize(
        &self,
        instruction: &str,
        pairs: &[SummaryPair],
    ) -> Result<String, SummaryError> {
        let instruction = require_instruction(instruction)?;
        let user_content = build_user_content(pairs);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instruction,
                },
                ChatMessage {
                    role: "user",
                    content: &user_content,
                },
            ],
        };

        info!(
            "[>]  LLM CALL [{}] ({} chars of diagnostics)",
            self.model,
            user_content.len()
        );

        let mut builder = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request);
        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }

        let response = check_status(builder.send().await?).await?;
        let chat: ChatResponse = response.json().await?;
        let text = first_choice(chat)?;
        debug!("[<]  LLM RESPONSE ({} chars)", text.len());
        Ok(text)
    }
}

// ============================================================================
// Anthropic Messages API
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

fn join_text_blocks(response: MessagesResponse) -> String {
    response
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect()
}

pub struct AnthropicSummarizer {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicSummarizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client: http_client(timeout),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn summarize(
        &self,
        instruction: &str,
        pairs: &[SummaryPair],
    ) -> Result<String, SummaryError> {
        let instruction = require_instruction(instruction)?;
        let user_content = build_user_content(pairs);
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system: instruction,
            messages: vec![ChatMessage {
                role: "user",
                content: &user_content,
            }],
        };

        info!(
            "[>]  LLM CALL [{}] ({} chars of diagnostics)",
            self.model,
            user_content.len()
        );

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;
        let messages: MessagesResponse = response.json().await?;
        let text = join_text_blocks(messages);
        debug!("[<]  LLM RESPONSE ({} chars)", text.len());
        Ok(text)
    }
}
