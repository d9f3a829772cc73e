//! Cloud-drive folder source (Google Drive v3 REST API).
//!
//! Lists the configured folder newest-first; Google Docs are exported as
//! plain text, text-like files are downloaded as-is. Anything else is
//! left out of the listing so it never reaches the ledger.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::DriveConfig;
use crate::error::SourceError;
use crate::pipeline::types::{ContentRef, Item, SourceKind};
use crate::sources::{SourceClient, check_response, malformed, request_error};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const PAGE_SIZE: u32 = 50;
const GOOGLE_DOC_MIME: &str = "application/vnd.google-apps.document";
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "log", "yaml", "yml", "xml", "html"];

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    web_view_link: Option<String>,
}

pub struct DriveSource {
    folder_id: String,
    access_token: SecretString,
    base_url: String,
    client: reqwest::Client,
}

impl DriveSource {
    pub fn new(config: &DriveConfig) -> Self {
        Self {
            folder_id: config.folder_id.clone(),
            access_token: config.access_token.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: crate::http::client(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, SourceError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(self.name(), e))?;
        check_response(self.name(), resp)
            .await?
            .text()
            .await
            .map_err(|e| request_error(self.name(), e))
    }
}

/// Whether the file can be downloaded and read as text.
pub fn is_text_like(mime_type: &str, name: &str) -> bool {
    if mime_type.starts_with("text/") || mime_type == "application/json" {
        return true;
    }
    name.rsplit_once('.')
        .map(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_readable(file: &DriveFile) -> bool {
    file.mime_type == GOOGLE_DOC_MIME || is_text_like(&file.mime_type, &file.name)
}

fn to_item(file: DriveFile) -> Item {
    let mut item = Item::new(SourceKind::DriveFile, &file.id, ContentRef::Remote(file.id.clone()))
        .with_meta("title", file.name)
        .with_meta("mime_type", file.mime_type);
    if let Some(modified) = file.modified_time {
        item = item.with_meta("date", modified);
    }
    if let Some(link) = file.web_view_link {
        item = item.with_meta("link", link);
    }
    item
}

fn parse_file_list(body: &str) -> Result<Vec<Item>, SourceError> {
    let list: FileList =
        serde_json::from_str(body).map_err(|e| malformed("drive", format!("file list: {e}")))?;
    Ok(list
        .files
        .into_iter()
        .filter(|file| {
            let readable = is_readable(file);
            if !readable {
                debug!(file = %file.name, mime = %file.mime_type, "Skipping unreadable drive file");
            }
            readable
        })
        .map(to_item)
        .collect())
}

#[async_trait]
impl SourceClient for DriveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::DriveFile
    }

    fn name(&self) -> &str {
        "drive"
    }

    async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
        let query = format!("'{}' in parents and trashed = false", self.folder_id);
        let page_size = PAGE_SIZE.to_string();
        let body = self
            .get_text(
                &format!("{}/files", self.base_url),
                &[
                    ("q", query.as_str()),
                    ("orderBy", "modifiedTime desc"),
                    ("pageSize", page_size.as_str()),
                    ("fields", "files(id,name,mimeType,modifiedTime,webViewLink)"),
                ],
            )
            .await?;
        parse_file_list(&body)
    }

    async fn fetch_payload(&self, item: &Item) -> Result<String, SourceError> {
        let mime = item.meta("mime_type").unwrap_or_default();
        let name = item.meta("title").unwrap_or_default();
        let file_url = format!("{}/files/{}", self.base_url, item.external_id);

        if mime == GOOGLE_DOC_MIME {
            return self
                .get_text(&format!("{file_url}/export"), &[("mimeType", "text/plain")])
                .await;
        }
        if is_text_like(mime, name) {
            return self.get_text(&file_url, &[("alt", "media")]).await;
        }
        Err(SourceError::Unsupported {
            name: self.name().to_string(),
            reason: format!("cannot read '{name}' ({mime})"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_detection_uses_mime_then_extension() {
        assert!(is_text_like("text/plain", "notes"));
        assert!(is_text_like("application/json", "data"));
        assert!(is_text_like("application/octet-stream", "README.MD"));
        assert!(!is_text_like("application/pdf", "report.pdf"));
        assert!(!is_text_like("image/png", "noext"));
    }

    #[test]
    fn file_list_becomes_items() {
        let body = r#"{"files":[
            {"id":"abc","name":"Plan.txt","mimeType":"text/plain","modifiedTime":"2024-05-01T10:00:00Z"},
            {"id":"def","name":"Roadmap","mimeType":"application/vnd.google-apps.document"}
        ]}"#;
        let items = parse_file_list(body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].external_id, "abc");
        assert_eq!(items[0].title(), "Plan.txt");
        assert_eq!(items[0].meta("date"), Some("2024-05-01T10:00:00Z"));
        assert_eq!(items[1].meta("mime_type"), Some(GOOGLE_DOC_MIME));
        assert_eq!(items[1].content_ref, ContentRef::Remote("def".into()));
    }

    #[test]
    fn unreadable_files_are_left_out_of_the_listing() {
        let body = r#"{"files":[
            {"id":"img","name":"diagram","mimeType":"image/png"},
            {"id":"pdf","name":"report.pdf","mimeType":"application/pdf"},
            {"id":"txt","name":"notes.md","mimeType":"application/octet-stream"}
        ]}"#;
        let items = parse_file_list(body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id, "txt");

        let only_image = r#"{"files":[{"id":"img","name":"diagram","mimeType":"image/png"}]}"#;
        assert!(parse_file_list(only_image).unwrap().is_empty());
    }

    #[test]
    fn empty_listing_is_fine() {
        assert!(parse_file_list("{}").unwrap().is_empty());
        assert!(parse_file_list("not json").is_err());
    }

    #[tokio::test]
    async fn binary_files_are_unsupported() {
        let source = DriveSource::new(&DriveConfig {
            folder_id: "f".into(),
            access_token: SecretString::from("t"),
            cadence: std::time::Duration::from_secs(60),
        });
        let item = Item::new(SourceKind::DriveFile, "x", ContentRef::Remote("x".into()))
            .with_meta("title", "photo.jpg")
            .with_meta("mime_type", "image/jpeg");
        let err = source.fetch_payload(&item).await.unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));
    }
}
