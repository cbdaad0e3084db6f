//! Analysis gateway: one tokenized transcript in, one structured result out.
//!
//! [`AnalysisGateway`] is the seam the orchestrator depends on; tests
//! substitute a scripted implementation. [`LlmGateway`] is the production
//! implementation backed by any [`LlmProvider`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use crate::providers::{CompletionRequest, LlmProvider, Message, ProviderError, Role, StopReason};

/// Gateway failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Worth retrying after a backoff.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Retrying the same request will not help.
    #[error("fatal gateway error: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Whether the retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

/// A tokenized transcript ready to leave the process.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Call identifier (not sensitive).
    pub call_id: String,
    /// Transcript with every sensitive value replaced by a vault token.
    pub tokenized_transcript: String,
}

/// Structured analysis, still tokenized.
#[derive(Debug, Clone)]
pub struct AnalysisReply {
    /// The JSON object returned by the model.
    pub analysis: Value,
    /// Provider-reported token usage, if any.
    pub tokens_used: Option<u64>,
}

/// Sends tokenized transcripts for analysis.
#[async_trait]
pub trait AnalysisGateway: Send + Sync {
    /// Analyze one call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transient`] for failures a retry may fix and
    /// [`GatewayError::Fatal`] otherwise.
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReply, GatewayError>;
}

/// [`AnalysisGateway`] over a chat completions provider in JSON mode.
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    max_tokens: u32,
    system_prompt: String,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("model", &self.provider.model_id())
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl LlmGateway {
    /// Wrap `provider`, fixing the system prompt to `today`.
    pub fn new(provider: Arc<dyn LlmProvider>, max_tokens: u32, today: NaiveDate) -> Self {
        Self {
            provider,
            max_tokens,
            system_prompt: system_prompt(today),
        }
    }

    fn build_request(&self, request: &AnalysisRequest) -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message {
                role: Role::User,
                content: format!(
                    "Call ID: {}\n\nTranscript:\n{}",
                    request.call_id, request.tokenized_transcript
                ),
            }],
            system: Some(self.system_prompt.clone()),
            max_tokens: Some(self.max_tokens),
            temperature: Some(0.0),
            json_output: true,
        }
    }
}

#[async_trait]
impl AnalysisGateway for LlmGateway {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReply, GatewayError> {
        let response = self.provider.complete(self.build_request(&request)).await?;

        if response.stop_reason == StopReason::ContentFilter {
            return Err(GatewayError::Fatal(
                "model output blocked by content filter".to_owned(),
            ));
        }

        let analysis = parse_analysis(&response.text)?;
        let tokens_used = response.usage.map(|u| u.total());
        debug!(
            call_id = %request.call_id,
            model = %response.model,
            tokens_used,
            "analysis received"
        );
        Ok(AnalysisReply {
            analysis,
            tokens_used,
        })
    }
}

/// Parse model output into a JSON object.
///
/// Tolerates a surrounding Markdown code fence. Anything that is not a JSON
/// object is transient: the model may well answer correctly next time.
///
/// # Errors
///
/// Returns [`GatewayError::Transient`] when no object can be parsed.
pub fn parse_analysis(text: &str) -> Result<Value, GatewayError> {
    let trimmed = strip_code_fence(text.trim());
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(GatewayError::Transient(
            "model output is JSON but not an object".to_owned(),
        )),
        Err(e) => Err(GatewayError::Transient(format!(
            "model output is not valid JSON: {e}"
        ))),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.strip_prefix("json").unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// System prompt describing the extraction schema and the token protocol.
pub fn system_prompt(today: NaiveDate) -> String {
    let today = today.format("%Y-%m-%d");
    format!(
        r#"You are a senior call-center analyst. Extract the call transcript into one JSON object.

Today is {today}. Convert relative dates ("next Monday") to YYYY-MM-DD based on today.

Requirements:
1. summary: 1-3 sentences: call objective, key event, final status.
2. customer_sentiment reflects how the customer ends the call, not the average.
3. Extract every INR amount as a number.
4. Flag customer_churn_risk whenever the customer mentions a competitor or a lawyer.

Schema:
{{
  "call_id": "string, exactly as given",
  "category": "tech_support" | "billing" | "plan_change" | "cancellation" | "privacy" | "other",
  "summary": "string",
  "customer_sentiment": "negative" | "neutral" | "positive" | "mixed",
  "resolution_status": "resolved" | "pending" | "escalated",
  "actions_taken": [{{ "type": "ticket_created" | "technician_scheduled" | "credit_applied" | "plan_activated" | "email_sent" | "sms_sent" | "other", "details": "string" }}],
  "followups_required": [{{ "owner": "agent" | "billing_team" | "field_team" | "security_team" | "customer", "due": "YYYY-MM-DD", "details": "string" }}],
  "risk_flags": ["possible_privacy_issue" | "customer_churn_risk" | "missed_appointment" | "billing_dispute" | "outage" | "none"],
  "entities": {{
    "case_ids": ["string"],
    "plan_prices_inr": [number],
    "time_windows": ["string"],
    "dates": ["YYYY-MM-DD"]
  }},
  "confidence": number between 0.0 and 1.0
}}

Only list case ids that appear in the transcript. Never invent one.
Return only the JSON object.

Placeholders:
- Bracketed tokens such as [REF_PERSON_1], [REF_PHONE_2] or [REF_CASE_ID_1] stand for redacted values.
- Copy them exactly, brackets included, wherever the value belongs. Do not alter, merge, renumber or invent them.
"#
    )
}
