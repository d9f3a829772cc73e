//! Event sources: polled clients that discover new items.

pub mod calendar;
pub mod drive;
pub mod mailbox;
pub mod slack;
pub mod telegram;
pub mod watcher;

pub use calendar::CalendarSource;
pub use drive::DriveSource;
pub use mailbox::MailboxSource;
pub use slack::SlackSource;
pub use telegram::TelegramSource;
pub use watcher::{Watcher, WatcherState};

use async_trait::async_trait;

use crate::error::SourceError;
use crate::pipeline::types::{ContentRef, Item, SourceKind};

/// A pollable event source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn name(&self) -> &str;

    /// List items currently visible at the source. Repeats are expected;
    /// the ledger filters them out.
    async fn list_candidates(&self) -> Result<Vec<Item>, SourceError>;

    /// Resolve the item's payload to text.
    ///
    /// The default serves inline content and rejects remote references.
    async fn fetch_payload(&self, item: &Item) -> Result<String, SourceError> {
        match &item.content_ref {
            ContentRef::Inline(text) => Ok(text.clone()),
            ContentRef::Remote(handle) => Err(SourceError::Unsupported {
                name: self.name().to_string(),
                reason: format!("cannot fetch remote content {handle}"),
            }),
        }
    }

    /// Mark the item handled at the source, after the ledger says done.
    async fn acknowledge(&self, _item: &Item) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Check a source API response and map failures to `SourceError`.
pub(crate) async fn check_response(
    name: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = crate::http::retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(SourceError::AuthFailed {
            name: name.to_string(),
            reason: crate::http::snippet(&body),
        });
    }
    Err(SourceError::Http {
        name: name.to_string(),
        status: status.as_u16(),
        body: crate::http::snippet(&body),
        retry_after,
    })
}

pub(crate) fn request_error(name: &str, e: reqwest::Error) -> SourceError {
    SourceError::RequestFailed {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> SourceError {
    SourceError::Malformed {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Truncate to at most `max` chars.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InlineOnly;

    #[async_trait]
    impl SourceClient for InlineOnly {
        fn kind(&self) -> SourceKind {
            SourceKind::ChatMessage
        }

        fn name(&self) -> &str {
            "inline"
        }

        async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn default_fetch_serves_inline_content() {
        let item = Item::new(SourceKind::ChatMessage, "1:1", ContentRef::Inline("hello".into()));
        assert_eq!(InlineOnly.fetch_payload(&item).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn default_fetch_rejects_remote_content() {
        let item = Item::new(SourceKind::ChatMessage, "1:1", ContentRef::Remote("x".into()));
        let err = InlineOnly.fetch_payload(&item).await.unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
