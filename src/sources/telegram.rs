//! Telegram chat source: text messages from allowed users via `getUpdates`.
//!
//! The update offset is advanced in memory after each listing. Telegram
//! only forgets updates once the next `getUpdates` call carries the new
//! offset, and the watcher admits a batch before polling again.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::DateTime;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::warn;

use crate::config::TelegramSourceConfig;
use crate::error::SourceError;
use crate::pipeline::types::{ContentRef, Item, SourceKind};
use crate::sources::{SourceClient, check_response, malformed, request_error};

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

pub struct TelegramSource {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    offset: AtomicI64,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramSource {
    pub fn new(config: &TelegramSourceConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            allowed_users: config.allowed_users.clone(),
            offset: AtomicI64::new(0),
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
}

/// Check if any identity (username or numeric id) is allowed.
pub fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Items from a `getUpdates` body, plus the next offset to request.
fn parse_updates(body: &str, allowed_users: &[String]) -> Result<(Vec<Item>, Option<i64>), SourceError> {
    let data: Value =
        serde_json::from_str(body).map_err(|e| malformed("telegram", format!("updates: {e}")))?;
    if data.get("ok").and_then(Value::as_bool) != Some(true) {
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(malformed("telegram", description));
    }

    let mut items = Vec::new();
    let mut next_offset = None;
    let updates = data.get("result").and_then(Value::as_array).cloned().unwrap_or_default();

    for update in &updates {
        if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
            next_offset = Some(update_id + 1);
        }
        let Some(message) = update.get("message") else {
            continue;
        };
        let Some(text) = message.get("text").and_then(Value::as_str) else {
            continue;
        };
        let (Some(chat_id), Some(message_id)) = (
            message.pointer("/chat/id").and_then(Value::as_i64),
            message.get("message_id").and_then(Value::as_i64),
        ) else {
            continue;
        };

        let username = message.pointer("/from/username").and_then(Value::as_str);
        let user_id = message
            .pointer("/from/id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string());
        let identities = username.into_iter().chain(user_id.as_deref());
        if !check_user_allowed(allowed_users, identities) {
            warn!(
                username = username.unwrap_or("unknown"),
                user_id = user_id.as_deref().unwrap_or("unknown"),
                "Ignoring Telegram message from unauthorized user"
            );
            continue;
        }

        let sender = message
            .pointer("/from/first_name")
            .and_then(Value::as_str)
            .or(username)
            .unwrap_or("unknown");
        let mut item = Item::new(
            SourceKind::ChatMessage,
            format!("{chat_id}:{message_id}"),
            ContentRef::Inline(text.to_string()),
        )
        .with_meta("chat_id", chat_id.to_string())
        .with_meta("sender", sender);
        if let Some(date) = message
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
        {
            item = item.with_meta("date", date.to_rfc3339());
        }
        items.push(item);
    }

    Ok((items, next_offset))
}

#[async_trait]
impl SourceClient for TelegramSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ChatMessage
    }

    fn name(&self) -> &str {
        "telegram"
    }

    async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
        let body = serde_json::json!({
            "offset": self.offset.load(Ordering::SeqCst),
            "timeout": 0,
            "allowed_updates": ["message"],
        });
        let resp = self
            .client
            .post(self.api_url("getUpdates"))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(self.name(), e.without_url()))?;
        let body = check_response(self.name(), resp)
            .await?
            .text()
            .await
            .map_err(|e| request_error(self.name(), e.without_url()))?;

        let (items, next_offset) = parse_updates(&body, &self.allowed_users)?;
        if let Some(next) = next_offset {
            self.offset.fetch_max(next, Ordering::SeqCst);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPDATES: &str = r#"{"ok":true,"result":[
        {"update_id":100,"message":{"message_id":7,"date":1700000000,
            "from":{"id":555,"username":"alice","first_name":"Alice"},
            "chat":{"id":555},"text":"Summarize the meeting notes"}},
        {"update_id":101,"message":{"message_id":8,"date":1700000001,
            "from":{"id":666,"username":"mallory"},"chat":{"id":666},"text":"hi"}},
        {"update_id":102,"message":{"message_id":9,"from":{"id":555},"chat":{"id":555},
            "photo":[{"file_id":"x"}]}}
    ]}"#;

    #[test]
    fn allowed_text_messages_become_items() {
        let (items, next) = parse_updates(UPDATES, &["alice".to_string()]).unwrap();
        assert_eq!(next, Some(103));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id, "555:7");
        assert_eq!(items[0].meta("chat_id"), Some("555"));
        assert_eq!(items[0].meta("sender"), Some("Alice"));
    }

    #[test]
    fn numeric_ids_are_accepted_in_allowlist() {
        let (items, _) = parse_updates(UPDATES, &["666".to_string()]).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id, "666:8");
    }

    #[test]
    fn empty_allowlist_denies_everyone() {
        let (items, next) = parse_updates(UPDATES, &[]).unwrap();
        assert!(items.is_empty());
        assert_eq!(next, Some(103), "offset still advances past ignored updates");
    }

    #[test]
    fn wildcard_and_exact_matching() {
        assert!(check_user_allowed(&["*".to_string()], ["anyone"]));
        assert!(!check_user_allowed(&["alice".to_string()], ["alice_bot"]));
        assert!(!check_user_allowed(&["Alice".to_string()], ["alice"]));
    }

    #[test]
    fn api_failure_is_an_error() {
        let err = parse_updates(r#"{"ok":false,"description":"Conflict"}"#, &[]).unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }
}
