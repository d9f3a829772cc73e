//! Telegram sink: replies in the originating chat for chat items, otherwise
//! notifies the owner chat.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::warn;

use crate::config::TelegramSinkConfig;
use crate::error::SinkError;
use crate::pipeline::types::{Item, SourceKind, SummaryResult};
use crate::sinks::{Sink, http_error, render_summary, request_error};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

pub struct TelegramSink {
    bot_token: SecretString,
    owner_chat_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(config: &TelegramSinkConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            owner_chat_id: config.owner_chat_id.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: crate::http::client(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    /// Chat items get their answer in the chat they came from.
    fn target_chat<'a>(&'a self, kind: SourceKind, chat_id: Option<&'a str>) -> &'a str {
        match (kind, chat_id) {
            (SourceKind::ChatMessage, Some(chat)) => chat,
            _ => &self.owner_chat_id,
        }
    }

    async fn call(&self, method: &str, body: &Value) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(self.name(), e.without_url()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let header_hint = crate::http::retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        let retry_after = header_hint.or_else(|| body_retry_after(&text));
        Err(http_error(self.name(), status, retry_after, &text))
    }

    /// Send one chunk, Markdown first with a plain-text fallback.
    async fn send_chunk(&self, chat_id: &str, text: &str) -> Result<(), SinkError> {
        let markdown = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        match self.call("sendMessage", &markdown).await {
            Ok(()) => Ok(()),
            Err(SinkError::Http { status: 400, .. }) => {
                warn!("Telegram sendMessage with Markdown failed; retrying without parse_mode");
                let plain = serde_json::json!({ "chat_id": chat_id, "text": text });
                self.call("sendMessage", &plain).await
            }
            Err(e) => Err(e),
        }
    }
}

/// `parameters.retry_after` from a Telegram error body.
fn body_retry_after(body: &str) -> Option<Duration> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .pointer("/parameters/retry_after")?
        .as_u64()
        .map(Duration::from_secs)
}

/// Split a message into chunks of at most `max_chars` chars.
/// Prefers newlines, then spaces, then hard-cuts.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[async_trait]
impl Sink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError> {
        let chat_id = self.target_chat(
            result.identity().source_kind,
            result.source.metadata.get("chat_id").map(String::as_str),
        );
        let text = match result.identity().source_kind {
            SourceKind::ChatMessage => result.text.clone(),
            _ => render_summary(result),
        };
        for chunk in split_message(&text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn deliver_partial(&self, item: &Item, _text: &str) -> Result<(), SinkError> {
        let chat_id = self.target_chat(item.source_kind, item.meta("chat_id"));
        self.call(
            "sendChatAction",
            &serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> TelegramSink {
        TelegramSink::new(&TelegramSinkConfig {
            bot_token: SecretString::from("123:ABC"),
            owner_chat_id: "999".into(),
        })
    }

    #[test]
    fn api_url_embeds_token() {
        assert_eq!(
            sink().api_url("sendMessage"),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn chat_items_reply_in_place_others_go_to_owner() {
        let s = sink();
        assert_eq!(s.target_chat(SourceKind::ChatMessage, Some("42")), "42");
        assert_eq!(s.target_chat(SourceKind::ChatMessage, None), "999");
        assert_eq!(s.target_chat(SourceKind::MailMessage, Some("42")), "999");
    }

    #[test]
    fn retry_after_is_read_from_body() {
        let body = r#"{"ok":false,"error_code":429,"parameters":{"retry_after":12}}"#;
        assert_eq!(body_retry_after(body), Some(Duration::from_secs(12)));
        assert_eq!(body_retry_after("nope"), None);
    }

    // ── Message splitting ───────────────────────────────────────────

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_over_limit_on_space() {
        let msg = format!("{} {}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let chunks = split_message(&"a".repeat(5000), 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_counts_chars_not_bytes() {
        let msg = "가".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1].chars().count(), 904);
    }
}
