//! Slack channel source: recent messages via `conversations.history`.

use async_trait::async_trait;
use chrono::DateTime;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::SlackSourceConfig;
use crate::error::SourceError;
use crate::pipeline::types::{ContentRef, Item, SourceKind};
use crate::sources::{SourceClient, check_response, malformed, request_error};

const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const HISTORY_LIMIT: u32 = 20;

#[derive(Debug, Deserialize)]
struct History {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    ts: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
}

pub struct SlackSource {
    bot_token: SecretString,
    channel_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl SlackSource {
    pub fn new(config: &SlackSourceConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: crate::http::client(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Slack reports most failures as HTTP 200 with `ok: false`.
fn api_error(error: &str) -> SourceError {
    match error {
        "ratelimited" => SourceError::Http {
            name: "slack".into(),
            status: 429,
            body: error.to_string(),
            retry_after: None,
        },
        "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" | "missing_scope" => {
            SourceError::AuthFailed {
                name: "slack".into(),
                reason: error.to_string(),
            }
        }
        other => malformed("slack", format!("API error: {other}")),
    }
}

/// Human-posted messages, oldest first.
fn parse_history(body: &str, channel_id: &str) -> Result<Vec<Item>, SourceError> {
    let history: History =
        serde_json::from_str(body).map_err(|e| malformed("slack", format!("history: {e}")))?;
    if !history.ok {
        return Err(api_error(history.error.as_deref().unwrap_or("unknown_error")));
    }

    let mut items: Vec<Item> = history
        .messages
        .into_iter()
        .filter(|m| m.subtype.is_none() && m.bot_id.is_none() && !m.text.trim().is_empty())
        .map(|m| {
            let mut item = Item::new(
                SourceKind::ChannelMessage,
                format!("{channel_id}:{}", m.ts),
                ContentRef::Inline(m.text),
            )
            .with_meta("channel_id", channel_id);
            if let Some(user) = m.user {
                item = item.with_meta("sender", user);
            }
            if let Some(date) = ts_to_rfc3339(&m.ts) {
                item = item.with_meta("date", date);
            }
            item
        })
        .collect();
    items.reverse();
    Ok(items)
}

fn ts_to_rfc3339(ts: &str) -> Option<String> {
    let secs: i64 = ts.split('.').next()?.parse().ok()?;
    DateTime::from_timestamp(secs, 0).map(|d| d.to_rfc3339())
}

#[async_trait]
impl SourceClient for SlackSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ChannelMessage
    }

    fn name(&self) -> &str {
        "slack"
    }

    async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
        let resp = self
            .client
            .get(format!("{}/conversations.history", self.base_url))
            .bearer_auth(self.bot_token.expose_secret())
            .query(&[
                ("channel", self.channel_id.as_str()),
                ("limit", &HISTORY_LIMIT.to_string()),
            ])
            .send()
            .await
            .map_err(|e| request_error(self.name(), e))?;
        let body = check_response(self.name(), resp)
            .await?
            .text()
            .await
            .map_err(|e| request_error(self.name(), e))?;
        parse_history(&body, &self.channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Classify, Transience};

    #[test]
    fn bot_and_system_messages_are_skipped() {
        let body = r#"{"ok":true,"messages":[
            {"type":"message","user":"U2","text":"second","ts":"1700000100.000200"},
            {"type":"message","subtype":"channel_join","user":"U3","text":"joined","ts":"1700000050.000100"},
            {"type":"message","bot_id":"B1","text":"beep","ts":"1700000040.000100"},
            {"type":"message","user":"U1","text":"first","ts":"1700000000.000100"}
        ]}"#;
        let items = parse_history(body, "C42").unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["C42:1700000000.000100", "C42:1700000100.000200"]);
        assert_eq!(items[0].meta("sender"), Some("U1"));
        assert!(items[0].meta("date").unwrap().starts_with("2023-11-14"));
    }

    #[test]
    fn api_errors_are_classified() {
        let limited = parse_history(r#"{"ok":false,"error":"ratelimited"}"#, "C").unwrap_err();
        assert!(matches!(limited.transience(), Transience::Transient { .. }));

        let auth = parse_history(r#"{"ok":false,"error":"invalid_auth"}"#, "C").unwrap_err();
        assert!(matches!(auth, SourceError::AuthFailed { .. }));

        let missing = parse_history(r#"{"ok":false,"error":"channel_not_found"}"#, "C").unwrap_err();
        assert_eq!(missing.transience(), Transience::Permanent);
    }
}
