//! Notion sink: one page per summary in the configured database.

use async_trait::async_trait;
use chrono::SecondsFormat;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::NotionConfig;
use crate::error::SinkError;
use crate::pipeline::types::SummaryResult;
use crate::sinks::{Sink, http_error, request_error};

const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";

/// Notion rejects rich-text runs longer than this.
const MAX_BLOCK_CHARS: usize = 2000;

pub struct NotionSink {
    token: SecretString,
    database_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl NotionSink {
    pub fn new(config: &NotionConfig) -> Self {
        Self {
            token: config.token.clone(),
            database_id: config.database_id.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: crate::http::client(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

fn rich_text(content: &str) -> Value {
    json!([{ "type": "text", "text": { "content": content } }])
}

/// Split into pieces of at most `max` chars.
fn split_chars(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(max.max(1)).map(|c| c.iter().collect()).collect()
}

/// Paragraph blocks, one per text paragraph, each within the size limit.
fn paragraph_blocks(text: &str) -> Vec<Value> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| split_chars(p, MAX_BLOCK_CHARS))
        .map(|piece| {
            json!({
                "object": "block",
                "type": "paragraph",
                "paragraph": { "rich_text": rich_text(&piece) },
            })
        })
        .collect()
}

fn page_body(database_id: &str, result: &SummaryResult) -> Value {
    let title: String = result.source.title.chars().take(MAX_BLOCK_CHARS).collect();
    json!({
        "parent": { "database_id": database_id },
        "properties": {
            "Title": { "title": rich_text(&title) },
            "Source": { "rich_text": rich_text(result.identity().source_kind.label()) },
            "Date": { "date": { "start": result.created_at.to_rfc3339_opts(SecondsFormat::Secs, true) } },
        },
        "children": paragraph_blocks(&result.text),
    })
}

#[async_trait]
impl Sink for NotionSink {
    fn name(&self) -> &str {
        "notion"
    }

    async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(format!("{}/pages", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .header("Notion-Version", NOTION_VERSION)
            .json(&page_body(&self.database_id, result))
            .send()
            .await
            .map_err(|e| request_error(self.name(), e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = crate::http::retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 401 || status.as_u16() == 404 {
            return Err(SinkError::Misconfigured {
                name: self.name().to_string(),
                reason: crate::http::snippet(&body),
            });
        }
        Err(http_error(self.name(), status, retry_after, &body))
    }
}
