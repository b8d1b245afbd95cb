//! Azure OpenAI chat-completions client that turns OCR text into a clinical note.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::endpoints::normalize_endpoint;
use crate::error::FormatError;

/// Token in the prompt template replaced by the OCR text.
pub const PLACEHOLDER: &str = "{{OCR_RESULT}}";

/// Appended to OCR text cut at `max_input_chars`.
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// Probed newest first when no version is pinned.
const API_VERSIONS: &[&str] = &["2024-10-21", "2024-06-01", "2024-02-01"];

const SYSTEM_INSTRUCTION: &str = "You are a clinical documentation assistant. \
You reformat text extracted from scanned patient intake forms into structured clinical notes. \
Never invent findings, diagnoses or medications that are not present in the source text. \
Preserve medication names, doses and dates exactly as written.";

/// Retry budget for HTTP 429 responses.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub backoff: Duration,
    pub max_retries: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(90),
            max_retries: 2,
        }
    }
}

/// Chat-completions client.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    rate_limit: RateLimitPolicy,
}

impl ChatClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    /// Substitute `text` into `template` and return the model's rewrite.
    pub async fn format(
        &self,
        text: &str,
        template: &str,
        config: &LlmConfig,
    ) -> Result<String, FormatError> {
        config.validate()?;
        let prompt = render_prompt(template, text, config.params.max_input_chars)?;
        let messages = vec![Message::system(SYSTEM_INSTRUCTION), Message::user(prompt)];
        self.chat(messages, config).await
    }

    /// Send a chat completion, trying each endpoint candidate in turn.
    ///
    /// Only a 404 moves on to the next candidate; it means this deployment
    /// path or API version does not exist on the resource.
    pub async fn chat(
        &self,
        messages: Vec<Message>,
        config: &LlmConfig,
    ) -> Result<String, FormatError> {
        let request = ChatCompletionRequest {
            messages,
            temperature: config.params.temperature,
            max_tokens: config.params.max_tokens,
            top_p: config.params.top_p,
            frequency_penalty: config.params.frequency_penalty,
            presence_penalty: config.params.presence_penalty,
        };

        let candidates = completion_urls(config);
        let mut last_not_found = None;

        for url in &candidates {
            match self.send_request(url, &request, config).await {
                Err(FormatError::Http { status, body }) if status == StatusCode::NOT_FOUND => {
                    warn!("Chat endpoint not found, trying next: {}", url);
                    last_not_found = Some(FormatError::Http { status, body });
                }
                other => return other,
            }
        }

        Err(last_not_found.unwrap_or(FormatError::ConfigIncomplete("language model endpoint")))
    }

    async fn send_request(
        &self,
        url: &str,
        request: &ChatCompletionRequest,
        config: &LlmConfig,
    ) -> Result<String, FormatError> {
        let max_attempts = self.rate_limit.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Sending chat completion to {} (attempt {})", url, attempt);

            let response = self
                .client
                .post(url)
                .header("api-key", &config.api_key)
                .header(CONTENT_TYPE, "application/json")
                .json(request)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= max_attempts {
                    return Err(FormatError::RateLimited {
                        attempts: max_attempts,
                    });
                }
                warn!(
                    "Chat completion rate limited ({}/{}), retrying in {:?}",
                    attempt, max_attempts, self.rate_limit.backoff
                );
                tokio::time::sleep(self.rate_limit.backoff).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FormatError::Http { status, body });
            }

            let response: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| FormatError::InvalidResponseShape(e.to_string()))?;

            if let Some(usage) = &response.usage {
                info!(
                    "Chat completion: {} tokens (prompt: {}, completion: {})",
                    usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
                );
            }

            return response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or(FormatError::EmptyCompletion);
        }
    }
}

/// Substitute OCR text into a prompt template.
///
/// Fails when the template lacks [`PLACEHOLDER`]; every occurrence is replaced.
pub fn render_prompt(template: &str, text: &str, max_chars: usize) -> Result<String, FormatError> {
    if !template.contains(PLACEHOLDER) {
        return Err(FormatError::InvalidTemplate(PLACEHOLDER));
    }
    Ok(template.replace(PLACEHOLDER, &truncate_text(text, max_chars)))
}

/// Cut `text` to `max_chars` characters, appending [`TRUNCATION_MARKER`] when cut.
pub fn truncate_text(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        None => Cow::Borrowed(text),
        Some((end, _)) => Cow::Owned(format!("{}{}", &text[..end], TRUNCATION_MARKER)),
    }
}

/// Completion URLs to try, in order.
fn completion_urls(config: &LlmConfig) -> Vec<String> {
    let base = normalize_endpoint(&config.endpoint);
    if base.is_empty() {
        return Vec::new();
    }
    if base.contains("/chat/completions") {
        return vec![base];
    }

    let deployment = config.deployment_name.trim();
    let versions: Vec<&str> = match config.api_version.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => vec![v],
        _ => API_VERSIONS.to_vec(),
    };

    versions
        .into_iter()
        .map(|version| {
            format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, deployment, version
            )
        })
        .collect()
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl Message {
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
