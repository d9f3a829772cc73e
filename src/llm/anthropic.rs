//! Anthropic-compatible Messages API client (MiniMax and similar gateways).
//!
//! No streaming: `complete_stream` falls back to the trait default, which
//! yields the single-shot text as the only delta.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role, status_error,
};

const PROVIDER: &str = "anthropic-compatible";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicCompatibleProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl AnthropicCompatibleProvider {
    pub fn new(api_key: SecretString, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: crate::http::client(),
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn request_body(model: &str, request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "assistant" } else { "user" };
            json!({ "role": role, "content": [{ "type": "text", "text": m.content }] })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(system) = request.system_prompt() {
        body["system"] = json!(system);
    }
    body
}

fn parse_response(value: &Value) -> CompletionResponse {
    let text: String = value
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = match value.get("stop_reason").and_then(Value::as_str) {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::Safety("refusal".to_string()),
        Some(other) => FinishReason::Other(other.to_string()),
        None if !text.is_empty() => FinishReason::Stop,
        None => FinishReason::Other("missing stop_reason".to_string()),
    };

    let usage = |k: &str| {
        value
            .pointer(&format!("/usage/{k}"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };

    CompletionResponse {
        content: (!text.is_empty()).then_some(text),
        input_tokens: usage("input_tokens"),
        output_tokens: usage("output_tokens"),
        finish_reason,
    }
}

#[async_trait]
impl LlmProvider for AnthropicCompatibleProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request_body(&self.model, &request))
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = crate::http::retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(PROVIDER, status, retry_after, &body));
        }

        let value: Value = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("response parse failed: {e}"),
        })?;
        let parsed = parse_response(&value);
        debug!(
            model = %self.model,
            finish_reason = ?parsed.finish_reason,
            "Anthropic-compatible completion"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn body_moves_system_prompt_out_of_messages() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
        ])
        .with_max_tokens(300);
        let body = request_body("m", &request);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn parses_first_text_blocks() {
        let value = json!({
            "content": [
                { "type": "thinking", "thinking": "hmm" },
                { "type": "text", "text": "Summary." }
            ],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 2 }
        });
        let response = parse_response(&value);
        assert_eq!(response.content.as_deref(), Some("Summary."));
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.output_tokens, 2);
    }

    #[test]
    fn refusal_is_a_safety_block() {
        let value = json!({ "content": [], "stop_reason": "refusal" });
        let response = parse_response(&value);
        assert!(response.finish_reason.is_blocked());
        assert!(response.content.is_none());
    }
}
