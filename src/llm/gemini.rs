//! Gemini `generateContent` / `streamGenerateContent` client.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, DeltaSender, FinishReason, LlmProvider, Role,
    status_error,
};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish and block reasons that mean the safety filter withheld output.
const SAFETY_REASONS: &[&str] = &[
    "SAFETY",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "RECITATION",
    "IMAGE_SAFETY",
    "OTHER_SAFETY",
];

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: crate::http::client(),
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.base_url, self.model)
    }

    async fn send(&self, url: String, body: &Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = crate::http::retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(status_error(PROVIDER, status, retry_after, &body))
    }
}

/// Build a `generateContent` request body.
fn request_body(request: &CompletionRequest) -> Value {
    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "model" } else { "user" };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let safety: Vec<Value> = HARM_CATEGORIES
        .iter()
        .map(|c| json!({ "category": c, "threshold": "BLOCK_ONLY_HIGH" }))
        .collect();

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(n) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(n));
    }

    let mut body = json!({
        "contents": contents,
        "safetySettings": safety,
        "generationConfig": generation,
    });
    if let Some(system) = request.system_prompt() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        r if SAFETY_REASONS.contains(&r) => FinishReason::Safety(r.to_string()),
        other => FinishReason::Other(other.to_string()),
    }
}

/// One `GenerateContentResponse`, whole or a stream fragment.
#[derive(Debug, Default)]
struct Fragment {
    text: Option<String>,
    finish_reason: Option<FinishReason>,
    input_tokens: u32,
    output_tokens: u32,
}

fn parse_fragment(value: &Value) -> Fragment {
    let mut fragment = Fragment::default();

    if let Some(usage) = value.get("usageMetadata") {
        let count = |k: &str| usage.get(k).and_then(Value::as_u64).unwrap_or(0) as u32;
        fragment.input_tokens = count("promptTokenCount");
        fragment.output_tokens = count("candidatesTokenCount");
    }

    if let Some(reason) = value
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        // A blocked prompt is a safety block whatever the reason code.
        fragment.finish_reason = Some(FinishReason::Safety(reason.to_string()));
        return fragment;
    }

    let Some(candidate) = value.pointer("/candidates/0") else {
        return fragment;
    };

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if !text.is_empty() {
        fragment.text = Some(text);
    }

    fragment.finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(map_finish_reason);
    fragment
}

/// Interpret a complete (non-streamed) response body.
fn parse_response(value: &Value) -> CompletionResponse {
    let fragment = parse_fragment(value);
    let finish_reason = fragment.finish_reason.unwrap_or_else(|| {
        if fragment.text.is_some() {
            FinishReason::Stop
        } else {
            FinishReason::Other("NO_CANDIDATES".to_string())
        }
    });
    CompletionResponse {
        content: fragment.text,
        input_tokens: fragment.input_tokens,
        output_tokens: fragment.output_tokens,
        finish_reason,
    }
}

/// Pop the next complete server-sent event's `data` payload off `buffer`.
fn next_sse_event(buffer: &mut Vec<u8>) -> Option<String> {
    loop {
        let (idx, sep_len) = find_event_end(buffer)?;
        let raw: Vec<u8> = buffer.drain(..idx + sep_len).collect();
        let event = String::from_utf8_lossy(&raw[..idx]).replace("\r\n", "\n");
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if !data.is_empty() {
            return Some(data.join("\n"));
        }
    }
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self
            .send(self.url("generateContent"), &request_body(&request))
            .await?;
        let value: Value = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("response parse failed: {e}"),
        })?;
        let parsed = parse_response(&value);
        debug!(
            model = %self.model,
            finish_reason = ?parsed.finish_reason,
            output_tokens = parsed.output_tokens,
            "Gemini completion"
        );
        Ok(parsed)
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        deltas: DeltaSender,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}?alt=sse", self.url("streamGenerateContent"));
        let response = self.send(url, &request_body(&request)).await?;

        let mut text = String::new();
        let mut finish_reason = None;
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut buffer = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("stream error: {e}"),
            })?;
            buffer.extend_from_slice(&chunk);

            while let Some(event) = next_sse_event(&mut buffer) {
                let Ok(value) = serde_json::from_str::<Value>(&event) else {
                    continue;
                };
                let fragment = parse_fragment(&value);
                if fragment.input_tokens > 0 {
                    input_tokens = fragment.input_tokens;
                }
                if fragment.output_tokens > 0 {
                    output_tokens = fragment.output_tokens;
                }
                if let Some(reason) = fragment.finish_reason {
                    finish_reason = Some(reason);
                }
                if finish_reason.as_ref().is_some_and(FinishReason::is_blocked) {
                    continue;
                }
                if let Some(delta) = fragment.text {
                    text.push_str(&delta);
                    let _ = deltas.send(delta).await;
                }
            }
        }

        let content = (!text.is_empty()).then_some(text);
        let finish_reason = finish_reason.unwrap_or_else(|| {
            if content.is_some() {
                FinishReason::Stop
            } else {
                FinishReason::Other("NO_CANDIDATES".to_string())
            }
        });
        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn body_carries_system_instruction_and_config() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
        ])
        .with_temperature(0.3)
        .with_max_tokens(300);
        let body = request_body(&request);

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 300);
        assert_eq!(body["safetySettings"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn parses_plain_text() {
        let value = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 3 }
        });
        let response = parse_response(&value);
        assert_eq!(response.content.as_deref(), Some("Hello world"));
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.input_tokens, 12);
    }

    #[test]
    fn safety_finish_reason_without_parts() {
        let value = json!({
            "candidates": [{ "finishReason": "SAFETY", "safetyRatings": [] }]
        });
        let response = parse_response(&value);
        assert!(response.content.is_none());
        assert_eq!(response.finish_reason, FinishReason::Safety("SAFETY".into()));
    }

    #[test]
    fn blocked_prompt_is_safety() {
        let value = json!({ "promptFeedback": { "blockReason": "OTHER" } });
        let response = parse_response(&value);
        assert!(response.finish_reason.is_blocked());
        assert!(response.content.is_none());
    }

    #[test]
    fn empty_response_is_not_blocked() {
        let response = parse_response(&json!({}));
        assert!(response.content.is_none());
        assert!(!response.finish_reason.is_blocked());
    }

    #[test]
    fn sse_events_split_across_chunks() {
        let mut buffer = b"data: {\"a\":1}\n\nda".to_vec();
        assert_eq!(next_sse_event(&mut buffer).as_deref(), Some("{\"a\":1}"));
        assert!(next_sse_event(&mut buffer).is_none());

        buffer.extend_from_slice(b"ta: {\"b\":2}\r\n\r\n");
        assert_eq!(next_sse_event(&mut buffer).as_deref(), Some("{\"b\":2}"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn sse_skips_comment_only_events() {
        let mut buffer = b": keep-alive\n\ndata: x\n\n".to_vec();
        assert_eq!(next_sse_event(&mut buffer).as_deref(), Some("x"));
    }
}
