//! Shared types for the hub: item identities, discovered items, summary
//! results and sink outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Source kinds ────────────────────────────────────────────────────

/// Kind of event source an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ChatMessage,
    DriveFile,
    MailMessage,
    CalendarEvent,
    ChannelMessage,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::ChatMessage,
        SourceKind::DriveFile,
        SourceKind::MailMessage,
        SourceKind::CalendarEvent,
        SourceKind::ChannelMessage,
    ];

    /// Stable string form stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ChatMessage => "chat_message",
            SourceKind::DriveFile => "drive_file",
            SourceKind::MailMessage => "mail_message",
            SourceKind::CalendarEvent => "calendar_event",
            SourceKind::ChannelMessage => "channel_message",
        }
    }

    /// Human label used in notifications.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::ChatMessage => "Chat message",
            SourceKind::DriveFile => "Drive file",
            SourceKind::MailMessage => "Email",
            SourceKind::CalendarEvent => "Calendar event",
            SourceKind::ChannelMessage => "Channel message",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "chat_message" => Ok(SourceKind::ChatMessage),
            "drive_file" => Ok(SourceKind::DriveFile),
            "mail_message" => Ok(SourceKind::MailMessage),
            "calendar_event" => Ok(SourceKind::CalendarEvent),
            "channel_message" => Ok(SourceKind::ChannelMessage),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

// ── Identity ────────────────────────────────────────────────────────

/// Globally unique key of an item: (source kind, source-native id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemIdentity {
    pub source_kind: SourceKind,
    pub external_id: String,
}

impl ItemIdentity {
    pub fn new(source_kind: SourceKind, external_id: impl Into<String>) -> Self {
        Self {
            source_kind,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_kind, self.external_id)
    }
}

// ── Items ───────────────────────────────────────────────────────────

/// Where an item's payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContentRef {
    /// Payload captured while listing.
    Inline(String),
    /// URL or API handle the source client resolves in `fetch_payload`.
    Remote(String),
}

/// A unit of work discovered by a watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub source_kind: SourceKind,
    pub external_id: String,
    pub content_ref: ContentRef,
    pub discovered_at: DateTime<Utc>,
    /// Source-specific details: sender, subject, title, chat id, mime type.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Item {
    pub fn new(source_kind: SourceKind, external_id: impl Into<String>, content_ref: ContentRef) -> Self {
        Self {
            source_kind,
            external_id: external_id.into(),
            content_ref,
            discovered_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Builder-style metadata insert.
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn identity(&self) -> ItemIdentity {
        ItemIdentity::new(self.source_kind, self.external_id.clone())
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Display title: explicit title, then subject, then sender, then the id.
    pub fn title(&self) -> String {
        ["title", "subject", "sender"]
            .iter()
            .find_map(|k| self.meta(k).filter(|v| !v.trim().is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {}", self.source_kind.label(), self.external_id))
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Snapshot of the item a summary was produced for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub identity: ItemIdentity,
    pub title: String,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<&Item> for SourceSnapshot {
    fn from(item: &Item) -> Self {
        Self {
            identity: item.identity(),
            title: item.title(),
            discovered_at: item.discovered_at,
            metadata: item.metadata.clone(),
        }
    }
}

/// Output of the summarization pipeline. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    /// Stored in the ledger as the entry's `result_ref`.
    pub id: Uuid,
    pub text: String,
    /// Per-chunk summaries in chunk order.
    pub partial: Vec<String>,
    pub safety_blocked: bool,
    /// Produced locally without any model call.
    pub short_circuited: bool,
    pub source: SourceSnapshot,
    pub created_at: DateTime<Utc>,
}

impl SummaryResult {
    pub fn new(item: &Item, text: String, partial: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            partial,
            safety_blocked: false,
            short_circuited: false,
            source: SourceSnapshot::from(item),
            created_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &ItemIdentity {
        &self.source.identity
    }
}

/// Result of delivering one summary to one sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkDeliveryOutcome {
    pub sink_name: String,
    pub ok: bool,
    pub error: Option<String>,
    pub attempts: u32,
}
