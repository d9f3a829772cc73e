//! Calendar source: upcoming events (Google Calendar v3 REST API).
//!
//! Each poll lists events starting within the lookahead window. The
//! identity includes the start time, so every occurrence of a recurring
//! event (and a rescheduled event) gets its own brief.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::CalendarConfig;
use crate::error::SourceError;
use crate::pipeline::types::{ContentRef, Item, SourceKind};
use crate::sources::{SourceClient, check_response, malformed, request_error};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<Event>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    start: EventTime,
    #[serde(default)]
    end: Option<EventTime>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    attendees: Vec<Attendee>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    #[serde(default)]
    date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attendee {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

pub struct CalendarSource {
    calendar_id: String,
    access_token: SecretString,
    lookahead: Duration,
    base_url: String,
    client: reqwest::Client,
}

impl CalendarSource {
    pub fn new(config: &CalendarConfig) -> Self {
        Self {
            calendar_id: config.calendar_id.clone(),
            access_token: config.access_token.clone(),
            lookahead: config.lookahead,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: crate::http::client(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn events_url(&self) -> Result<reqwest::Url, SourceError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| malformed(self.name(), format!("base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| malformed(self.name(), "base URL cannot take a path"))?
            .extend(["calendars", self.calendar_id.as_str(), "events"]);
        Ok(url)
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn describe(event: &Event, start: DateTime<Utc>) -> String {
    let mut lines = vec![
        format!("Title: {}", event.summary.as_deref().unwrap_or("(untitled)")),
        format!("Start: {}", rfc3339(start)),
    ];
    if let Some(end) = event.end.as_ref().and_then(|e| e.date_time) {
        lines.push(format!("End: {}", rfc3339(end)));
    }
    if let Some(location) = event.location.as_deref().filter(|l| !l.is_empty()) {
        lines.push(format!("Location: {location}"));
    }
    let attendees: Vec<&str> = event
        .attendees
        .iter()
        .filter_map(|a| a.display_name.as_deref().or(a.email.as_deref()))
        .collect();
    if !attendees.is_empty() {
        lines.push(format!("Attendees: {}", attendees.join(", ")));
    }
    if let Some(description) = event.description.as_deref().filter(|d| !d.is_empty()) {
        lines.push(String::new());
        lines.push(description.to_string());
    }
    lines.join("\n")
}

/// Timed events that have not started yet. All-day events are skipped.
fn parse_events(body: &str, now: DateTime<Utc>) -> Result<Vec<Item>, SourceError> {
    let list: EventList =
        serde_json::from_str(body).map_err(|e| malformed("calendar", format!("event list: {e}")))?;

    Ok(list
        .items
        .into_iter()
        .filter_map(|event| {
            let start = event.start.date_time.filter(|s| *s > now)?;
            let content = describe(&event, start);
            let mut item = Item::new(
                SourceKind::CalendarEvent,
                format!("{}@{}", event.id, rfc3339(start)),
                ContentRef::Inline(content),
            )
            .with_meta("start", rfc3339(start));
            if let Some(title) = event.summary {
                item = item.with_meta("title", title);
            }
            Some(item)
        })
        .collect())
}

#[async_trait]
impl SourceClient for CalendarSource {
    fn kind(&self) -> SourceKind {
        SourceKind::CalendarEvent
    }

    fn name(&self) -> &str {
        "calendar"
    }

    async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(self.lookahead)
                .map_err(|e| malformed(self.name(), format!("lookahead: {e}")))?;

        let resp = self
            .client
            .get(self.events_url()?)
            .bearer_auth(self.access_token.expose_secret())
            .query(&[
                ("timeMin", rfc3339(now)),
                ("timeMax", rfc3339(until)),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ])
            .send()
            .await
            .map_err(|e| request_error(self.name(), e))?;
        let body = check_response(self.name(), resp)
            .await?
            .text()
            .await
            .map_err(|e| request_error(self.name(), e))?;
        parse_events(&body, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2024-10-01T09:00:00Z".parse().unwrap()
    }

    const BODY: &str = r#"{"items":[
        {"id":"ev1","summary":"Design review","start":{"dateTime":"2024-10-01T09:30:00Z"},
         "end":{"dateTime":"2024-10-01T10:00:00Z"},"location":"Room 4",
         "attendees":[{"email":"a@x.io","displayName":"Ana"},{"email":"b@x.io"}],
         "description":"Go through the storage proposal."},
        {"id":"ev2","summary":"Offsite","start":{"date":"2024-10-01"}},
        {"id":"ev3","summary":"Standup","start":{"dateTime":"2024-10-01T08:45:00Z"}}
    ]}"#;

    #[test]
    fn upcoming_timed_events_only() {
        let items = parse_events(BODY, now()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id, "ev1@2024-10-01T09:30:00Z");
        assert_eq!(items[0].title(), "Design review");
    }

    #[test]
    fn brief_contains_event_details() {
        let items = parse_events(BODY, now()).unwrap();
        let ContentRef::Inline(content) = &items[0].content_ref else {
            panic!("calendar content should be inline");
        };
        assert!(content.contains("Location: Room 4"));
        assert!(content.contains("Attendees: Ana, b@x.io"));
        assert!(content.ends_with("Go through the storage proposal."));
    }

    #[test]
    fn rescheduled_occurrence_is_a_new_identity() {
        let moved = BODY.replace("09:30:00Z", "09:45:00Z");
        let a = parse_events(BODY, now()).unwrap();
        let b = parse_events(&moved, now()).unwrap();
        assert_ne!(a[0].identity(), b[0].identity());
    }

    #[test]
    fn calendar_id_is_escaped_in_path() {
        let source = CalendarSource::new(&CalendarConfig {
            calendar_id: "en.usa#holiday@group.v.calendar.google.com".into(),
            access_token: SecretString::from("t"),
            lookahead: Duration::from_secs(3600),
            cadence: Duration::from_secs(300),
        });
        let url = source.events_url().unwrap();
        assert!(url.as_str().contains("/calendars/en.usa%23holiday@group"));
        assert!(url.path().ends_with("/events"));
    }
}
