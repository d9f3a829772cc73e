//! Email sink: sends each summary as a short SMTP digest via lettre.
//!
//! lettre's SMTP transport is blocking, so sends run on the blocking pool.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::SinkError;
use crate::pipeline::types::SummaryResult;
use crate::sinks::{Sink, render_summary};

pub struct EmailSink {
    config: Arc<SmtpConfig>,
}

impl EmailSink {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

fn misconfigured(reason: String) -> SinkError {
    SinkError::Misconfigured {
        name: "email".into(),
        reason,
    }
}

fn subject(result: &SummaryResult) -> String {
    let prefix = if result.safety_blocked { "[blocked] " } else { "" };
    format!(
        "{prefix}[{}] {}",
        result.identity().source_kind.label(),
        result.source.title
    )
}

fn build_message(config: &SmtpConfig, result: &SummaryResult) -> Result<Message, SinkError> {
    Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| misconfigured(format!("invalid from address: {e}")))?,
        )
        .to(config
            .to_address
            .parse()
            .map_err(|e| misconfigured(format!("invalid to address: {e}")))?)
        .subject(subject(result))
        .body(render_summary(result))
        .map_err(|e| misconfigured(format!("failed to build email: {e}")))
}

fn send(config: &SmtpConfig, message: &Message) -> Result<(), SinkError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );
    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| misconfigured(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .build();

    transport.send(message).map_err(|e| {
        if e.is_permanent() {
            SinkError::Rejected {
                name: "email".into(),
                reason: e.to_string(),
            }
        } else {
            SinkError::RequestFailed {
                name: "email".into(),
                reason: e.to_string(),
            }
        }
    })?;
    Ok(())
}

#[async_trait]
impl Sink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError> {
        let message = build_message(&self.config, result)?;
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || send(&config, &message))
            .await
            .map_err(|e| SinkError::RequestFailed {
                name: "email".into(),
                reason: format!("send task failed: {e}"),
            })??;
        info!(to = %self.config.to_address, item = %result.identity(), "Email digest sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    use crate::pipeline::types::{ContentRef, Item, SourceKind};

    fn config(from: &str) -> SmtpConfig {
        SmtpConfig {
            host: "smtp.test.com".into(),
            port: 587,
            username: "user".into(),
            password: SecretString::from("pass"),
            from_address: from.into(),
            to_address: "me@test.com".into(),
        }
    }

    fn result() -> SummaryResult {
        let item = Item::new(SourceKind::CalendarEvent, "ev@t", ContentRef::Inline("x".into()))
            .with_meta("title", "Design review");
        SummaryResult::new(&item, "Bring the storage numbers.".into(), vec![])
    }

    #[test]
    fn subject_names_source_and_title() {
        assert_eq!(subject(&result()), "[Calendar event] Design review");
    }

    #[test]
    fn message_builds_with_valid_addresses() {
        assert!(build_message(&config("hub@test.com"), &result()).is_ok());
    }

    #[test]
    fn invalid_from_address_is_misconfiguration() {
        let err = build_message(&config("not an address"), &result()).unwrap_err();
        assert!(matches!(err, SinkError::Misconfigured { .. }));
    }
}
