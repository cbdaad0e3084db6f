//! LLM provider abstraction layer.
//!
//! Defines the [`LlmProvider`] trait and the shared request/response types.
//! One provider is implemented: [`openai::OpenAiProvider`], which speaks the
//! OpenAI-compatible `/chat/completions` API (OpenAI, Groq and compatible
//! gateways).

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod openai;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message.
    System,
    /// Human user message.
    User,
    /// Assistant (LLM) message.
    Assistant,
}

/// A text message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// Message text.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// A request to an LLM provider for a completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation including the latest user message.
    pub messages: Vec<Message>,
    /// System prompt (injected before messages).
    pub system: Option<String>,
    /// Maximum tokens in the response.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Ask the provider to constrain output to a JSON object.
    pub json_output: bool,
}

/// The reason a completion stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Normal end of turn.
    EndTurn,
    /// Max token limit reached.
    MaxTokens,
    /// Output was filtered by the provider.
    ContentFilter,
    /// Provider-specific other reason.
    Other(String),
}

/// Usage statistics for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageStats {
    /// Tokens used in the prompt/input.
    pub input_tokens: u32,
    /// Tokens generated in the response.
    pub output_tokens: u32,
}

impl UsageStats {
    /// Input plus output tokens.
    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens).saturating_add(u64::from(self.output_tokens))
    }
}

/// The response from an LLM provider.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Response text.
    pub text: String,
    /// Why the model stopped.
    pub stop_reason: StopReason,
    /// Token usage, when reported.
    pub usage: Option<UsageStats>,
    /// The model identifier that served this response.
    pub model: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by model providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream provider responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body (sanitized, truncated).
        body: String,
    },
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, connection failures, throttling (429), conflicts/timeouts
    /// reported as 408/409 and server errors are transient. Other 4xx
    /// statuses and malformed provider envelopes are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::HttpStatus { status, .. } => {
                matches!(status, 408 | 409 | 429) || (500..=599).contains(status)
            }
            Self::Parse(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure, `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace, mask key-shaped secrets and cap the length of an
/// upstream error body before it reaches logs or the checkpoint.
pub fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-[A-Za-z0-9_\-]{20,}",
        r"gsk_[A-Za-z0-9]{20,}",
        r"Bearer [A-Za-z0-9._\-]{10,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Core LLM provider interface.
///
/// Implementations must be `Send + Sync` so one provider can serve many
/// concurrent call-processing tasks.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request a completion from the LLM.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on API, network, or parse failure.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// The model identifier string this provider is instantiated for.
    fn model_id(&self) -> &str;
}
