//! Provider-agnostic LLM types and the `LlmProvider` trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a completion request.
#[derive(Debug, Clone)]
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Concatenated system messages, if any.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    /// The provider's safety filter withheld the output.
    Safety(String),
    Other(String),
}

impl FinishReason {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FinishReason::Safety(_))
    }
}

/// A completion response. `content` is `None` when the provider returned
/// no text at all.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

/// Channel receiving incremental text while a completion streams.
pub type DeltaSender = mpsc::Sender<String>;

/// An LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Single-shot completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion. Text deltas go to `deltas`; the assembled
    /// response is returned at the end.
    ///
    /// Providers without streaming send the whole text as one delta.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
        deltas: DeltaSender,
    ) -> Result<CompletionResponse, LlmError> {
        let response = self.complete(request).await?;
        if !response.finish_reason.is_blocked() {
            if let Some(text) = response.content.as_ref().filter(|t| !t.is_empty()) {
                let _ = deltas.send(text.clone()).await;
            }
        }
        Ok(response)
    }
}

/// Map a non-success HTTP response to an [`LlmError`].
pub(crate) fn status_error(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<std::time::Duration>,
    body: &str,
) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        code => LlmError::Http {
            provider: provider.to_string(),
            status: code,
            body: crate::http::snippet(body),
        },
    }
}
