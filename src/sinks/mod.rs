//! Notification and storage sinks that receive summary results.

pub mod email;
pub mod notion;
pub mod slack;
pub mod telegram;
pub mod webhook;

pub use email::EmailSink;
pub use notion::NotionSink;
pub use slack::SlackSink;
pub use telegram::TelegramSink;
pub use webhook::WebhookSink;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::pipeline::types::{Item, SummaryResult};

/// A delivery target for summary results.
///
/// Sinks are assumed idempotent enough for at-least-once delivery: a
/// retried delivery may repeat a notification.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError>;

    /// Incremental text while a summary is still forming. Best effort.
    async fn deliver_partial(&self, _item: &Item, _text: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Notification body shared by the chat-style sinks.
pub(crate) fn render_summary(result: &SummaryResult) -> String {
    let kind = result.identity().source_kind.label();
    let mut out = format!("{kind}: {}\n\n{}", result.source.title, result.text);
    if let Some(sender) = result.source.metadata.get("sender") {
        out.push_str(&format!("\n\nFrom: {sender}"));
    }
    out
}

/// Map a non-success HTTP status from a sink API.
pub(crate) fn http_error(
    name: &str,
    status: reqwest::StatusCode,
    retry_after: Option<std::time::Duration>,
    body: &str,
) -> SinkError {
    if status.as_u16() == 429 {
        return SinkError::RateLimited {
            name: name.to_string(),
            retry_after,
        };
    }
    SinkError::Http {
        name: name.to_string(),
        status: status.as_u16(),
        body: crate::http::snippet(body),
        retry_after,
    }
}

pub(crate) fn request_error(name: &str, e: reqwest::Error) -> SinkError {
    SinkError::RequestFailed {
        name: name.to_string(),
        reason: e.to_string(),
    }
}
