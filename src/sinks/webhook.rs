//! Webhook sink: posts a JSON envelope to an automation endpoint (n8n-style).

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::config::WebhookConfig;
use crate::error::SinkError;
use crate::pipeline::types::SummaryResult;
use crate::sinks::{Sink, http_error, request_error};

/// Event type carried in every envelope.
const EVENT_TYPE: &str = "summary";

pub struct WebhookSink {
    url: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            client: crate::http::client(),
        }
    }
}

/// `{timestamp, source, type, data}`.
fn envelope(result: &SummaryResult) -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "source": result.identity().source_kind.as_str(),
        "type": EVENT_TYPE,
        "data": {
            "id": result.id,
            "external_id": result.identity().external_id,
            "title": result.source.title,
            "summary": result.text,
            "partial": result.partial,
            "safety_blocked": result.safety_blocked,
            "metadata": result.source.metadata,
            "created_at": result.created_at,
        },
    })
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError> {
        let mut request = self.client.post(&self.url).json(&envelope(result));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let resp = request
            .send()
            .await
            .map_err(|e| request_error(self.name(), e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = crate::http::retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(http_error(self.name(), status, retry_after, &body))
    }
}
