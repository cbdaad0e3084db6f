//! OpenAI-compatible provider using the `/chat/completions` API.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::ApiKey;

use super::{
    check_http_response, CompletionRequest, CompletionResponse, LlmProvider, ProviderError, Role,
    StopReason, UsageStats,
};

const DEFAULT_MAX_TOKENS: u32 = 2048;

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Chat completions API request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct OpenAiRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<OpenAiMessage>,
    /// Maximum completion tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Output format constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

/// A message in chat format.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct OpenAiMessage {
    /// Role (`system`, `user`, `assistant`).
    pub role: String,
    /// Text content.
    pub content: String,
}

/// `response_format` request field.
#[doc(hidden)]
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ResponseFormat {
    /// Format kind, `json_object` for JSON mode.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Chat completions API response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiResponse {
    /// Response choices.
    pub choices: Vec<OpenAiChoice>,
    /// Model that served the response.
    pub model: String,
    /// Token usage.
    pub usage: Option<OpenAiUsage>,
}

/// A response choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiChoice {
    /// Assistant message for this choice.
    pub message: OpenAiResponseMessage,
    /// Why generation stopped.
    pub finish_reason: Option<String>,
}

/// Assistant message.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiResponseMessage {
    /// Optional text content.
    pub content: Option<String>,
}

/// Usage statistics.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OpenAiUsage {
    /// Prompt token count.
    pub prompt_tokens: Option<u32>,
    /// Completion token count.
    pub completion_tokens: Option<u32>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completions provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    endpoint: String,
    model_name: String,
    api_key: ApiKey,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider for `model_name` at the full chat completions `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Request` if the HTTP client cannot be built.
    pub fn new(
        endpoint: String,
        model_name: String,
        api_key: ApiKey,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            model_name,
            api_key,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// Request / Response builders (pub for integration testing)
// ---------------------------------------------------------------------------

/// Build an API request from a completion request.
#[doc(hidden)]
pub fn build_request(model: &str, request: &CompletionRequest) -> OpenAiRequest {
    let mut messages: Vec<OpenAiMessage> = Vec::new();

    if let Some(system) = &request.system {
        messages.push(OpenAiMessage {
            role: "system".to_owned(),
            content: system.clone(),
        });
    }

    for msg in &request.messages {
        messages.push(OpenAiMessage {
            role: role_to_openai(msg.role).to_owned(),
            content: msg.content.clone(),
        });
    }

    OpenAiRequest {
        model: model.to_owned(),
        messages,
        max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        temperature: request.temperature,
        response_format: request.json_output.then(|| ResponseFormat {
            kind: "json_object".to_owned(),
        }),
    }
}

/// Parse an API response into a completion response.
///
/// # Errors
///
/// Returns `ProviderError::Parse` if the response cannot be deserialized or
/// has no choices.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<CompletionResponse, ProviderError> {
    let resp: OpenAiResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("missing choices[0]".to_owned()))?;

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("stop") | None => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("content_filter") => StopReason::ContentFilter,
        Some(other) => StopReason::Other(other.to_owned()),
    };

    let usage = resp.usage.map(|u| UsageStats {
        input_tokens: u.prompt_tokens.unwrap_or(0),
        output_tokens: u.completion_tokens.unwrap_or(0),
    });

    Ok(CompletionResponse {
        text: choice.message.content.unwrap_or_default(),
        stop_reason,
        usage,
        model: resp.model,
    })
}

fn role_to_openai(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

// ---------------------------------------------------------------------------
// Trait impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let api_request = build_request(&self.model_name, &request);

        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header(
                "authorization",
                format!("Bearer {}", self.api_key.expose()),
            )
            .json(&api_request)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        parse_response(&payload)
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}
