//! Slack sink: posts each summary to a channel with `chat.postMessage`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::SlackSinkConfig;
use crate::error::SinkError;
use crate::pipeline::types::SummaryResult;
use crate::sinks::{Sink, http_error, render_summary, request_error};

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackSink {
    bot_token: SecretString,
    channel_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl SlackSink {
    pub fn new(config: &SlackSinkConfig) -> Self {
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

/// Interpret a 200 reply; Slack signals failure with `ok: false`.
fn check_reply(body: &str) -> Result<(), SinkError> {
    let reply: ApiReply = serde_json::from_str(body).map_err(|e| SinkError::Rejected {
        name: "slack".into(),
        reason: format!("unreadable reply: {e}"),
    })?;
    if reply.ok {
        return Ok(());
    }
    let error = reply.error.unwrap_or_else(|| "unknown_error".into());
    Err(match error.as_str() {
        "ratelimited" => SinkError::RateLimited {
            name: "slack".into(),
            retry_after: None,
        },
        "invalid_auth" | "not_authed" | "token_revoked" | "channel_not_found" | "not_in_channel" => {
            SinkError::Misconfigured {
                name: "slack".into(),
                reason: error,
            }
        }
        _ => SinkError::Rejected {
            name: "slack".into(),
            reason: error,
        },
    })
}

#[async_trait]
impl Sink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&serde_json::json!({
                "channel": self.channel_id,
                "text": render_summary(result),
            }))
            .send()
            .await
            .map_err(|e| request_error(self.name(), e))?;

        let status = resp.status();
        let retry_after = crate::http::retry_after(resp.headers());
        let body = resp.text().await.map_err(|e| request_error(self.name(), e))?;
        if !status.is_success() {
            return Err(http_error(self.name(), status, retry_after, &body));
        }
        check_reply(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Classify, Transience};

    #[test]
    fn ok_reply_is_success() {
        assert!(check_reply(r#"{"ok":true,"ts":"1.2"}"#).is_ok());
    }

    #[test]
    fn ratelimited_reply_is_transient() {
        let err = check_reply(r#"{"ok":false,"error":"ratelimited"}"#).unwrap_err();
        assert!(err.transience().is_transient());
    }

    #[test]
    fn other_errors_are_permanent() {
        let err = check_reply(r#"{"ok":false,"error":"channel_not_found"}"#).unwrap_err();
        assert!(matches!(err, SinkError::Misconfigured { .. }));
        assert_eq!(err.transience(), Transience::Permanent);

        let err = check_reply(r#"{"ok":false,"error":"msg_too_long"}"#).unwrap_err();
        assert!(matches!(err, SinkError::Rejected { .. }));
    }
}
