//! Mailbox source: raw IMAP over rustls, parsed with mail-parser.
//!
//! Listing uses `BODY.PEEK[]` so polling never changes flags; a message is
//! only marked `\Seen` by `acknowledge`, after its summary is recorded.
//! The IMAP client is blocking and runs on the blocking thread pool.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::MailboxConfig;
use crate::error::SourceError;
use crate::pipeline::types::{ContentRef, Item, SourceKind};
use crate::sources::{SourceClient, truncate_chars};

/// Body text beyond this many chars is dropped.
const MAX_BODY_CHARS: usize = 8000;

/// Most recent unseen messages fetched per poll.
const MAX_MESSAGES_PER_POLL: usize = 20;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

pub struct MailboxSource {
    config: Arc<MailboxConfig>,
}

impl MailboxSource {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn is_sender_allowed(&self, email: &str) -> bool {
        is_sender_allowed(&self.config.allowed_senders, email)
    }
}

#[async_trait]
impl SourceClient for MailboxSource {
    fn kind(&self) -> SourceKind {
        SourceKind::MailMessage
    }

    fn name(&self) -> &str {
        "mailbox"
    }

    async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
        let config = Arc::clone(&self.config);
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| SourceError::Imap(format!("fetch task failed: {e}")))??;

        let mut items = Vec::new();
        for (uid, raw) in fetched {
            let Some(mail) = parse_mail(uid, &raw) else {
                debug!(uid, "Skipping unparseable message");
                continue;
            };
            if mail.sender.eq_ignore_ascii_case(&self.config.self_address) {
                debug!(uid, "Skipping self-sent message");
                continue;
            }
            if !self.is_sender_allowed(&mail.sender) {
                debug!(uid, sender = %mail.sender, "Sender not in allowlist");
                continue;
            }
            items.push(mail.into_item());
        }
        Ok(items)
    }

    async fn acknowledge(&self, item: &Item) -> Result<(), SourceError> {
        let uid: u32 = item
            .meta("uid")
            .and_then(|u| u.parse().ok())
            .ok_or_else(|| crate::sources::malformed("mailbox", "item has no IMAP uid"))?;
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || mark_seen(&config, uid))
            .await
            .map_err(|e| SourceError::Imap(format!("store task failed: {e}")))?
    }
}

// ── Message parsing ─────────────────────────────────────────────────

/// The parts of a message the hub cares about.
#[derive(Debug)]
struct ParsedMail {
    uid: u32,
    message_id: Option<String>,
    sender: String,
    subject: String,
    date: Option<String>,
    body: String,
}

impl ParsedMail {
    fn into_item(self) -> Item {
        let external_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| format!("uid-{}", self.uid));
        let content = format!(
            "Subject: {}\nFrom: {}\n\n{}",
            self.subject,
            self.sender,
            truncate_chars(&self.body, MAX_BODY_CHARS)
        );
        let mut item = Item::new(SourceKind::MailMessage, external_id, ContentRef::Inline(content))
            .with_meta("sender", self.sender)
            .with_meta("subject", self.subject)
            .with_meta("uid", self.uid.to_string());
        if let Some(date) = self.date {
            item = item.with_meta("date", date);
        }
        item
    }
}

fn parse_mail(uid: u32, raw: &[u8]) -> Option<ParsedMail> {
    let parsed = MessageParser::default().parse(raw)?;
    Some(ParsedMail {
        uid,
        message_id: parsed.message_id().map(str::to_string),
        sender: parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".into()),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        date: parsed.date().map(|d| d.to_rfc3339()),
        body: extract_text(&parsed),
    })
}

/// Readable text: plain body, then stripped HTML, then a text attachment.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    "(no readable content)".to_string()
}

/// Check a sender against the allowlist.
///
/// - Empty list → deny all
/// - `*` → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email = email.to_lowercase();
    allowed.iter().any(|a| {
        let a = a.to_lowercase();
        if a.starts_with('@') {
            email.ends_with(&a)
        } else if a.contains('@') {
            a == email
        } else {
            email.ends_with(&format!("@{a}"))
        }
    })
}

/// Strip HTML tags and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── IMAP ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

fn io_error(e: impl std::fmt::Display) -> SourceError {
    SourceError::Imap(e.to_string())
}

impl ImapSession {
    fn connect(host: &str, port: u16) -> Result<Self, SourceError> {
        let tcp = TcpStream::connect((host, port)).map_err(io_error)?;
        tcp.set_read_timeout(Some(IO_TIMEOUT)).map_err(io_error)?;
        tcp.set_write_timeout(Some(IO_TIMEOUT)).map_err(io_error)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| SourceError::Imap(format!("invalid IMAP host {host}: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(io_error)?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(SourceError::Imap(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).map_err(io_error)?;
        if n == 0 {
            return Err(SourceError::Imap("connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send one command and collect its untagged lines and literals.
    fn command(&mut self, command: &str) -> Result<Response, SourceError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{tag} {command}\r\n").as_bytes())
            .map_err(io_error)?;
        stream.flush().map_err(io_error)?;

        let done = format!("{tag} ");
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&done) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                let verb = command.split_whitespace().next().unwrap_or_default();
                return Err(SourceError::Imap(format!("{verb} failed: {}", status.trim_end())));
            }
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0; len];
                self.stream.read_exact(&mut literal).map_err(io_error)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), SourceError> {
        self.command(&format!("LOGIN {} {}", quote(username), quote(password)))
            .map(|_| ())
            .map_err(|e| SourceError::AuthFailed {
                name: "mailbox".into(),
                reason: e.to_string(),
            })
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Size of a `{N}` literal announced at the end of a line.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.trim_end().strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Raw bytes of the newest unseen messages, keyed by UID.
fn fetch_unseen(config: &MailboxConfig) -> Result<Vec<(u32, Vec<u8>)>, SourceError> {
    let mut session = ImapSession::connect(&config.imap_host, config.imap_port)?;
    session.login(&config.username, config.password.expose_secret())?;
    session.command("EXAMINE \"INBOX\"")?;

    let mut uids = parse_search(&session.command("UID SEARCH UNSEEN")?.lines);
    uids.sort_unstable();
    if uids.len() > MAX_MESSAGES_PER_POLL {
        uids.drain(..uids.len() - MAX_MESSAGES_PER_POLL);
    }

    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        let response = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if let Some(raw) = response.literals.into_iter().next() {
            messages.push((uid, raw));
        }
    }
    session.logout();
    Ok(messages)
}

fn mark_seen(config: &MailboxConfig, uid: u32) -> Result<(), SourceError> {
    let mut session = ImapSession::connect(&config.imap_host, config.imap_port)?;
    session.login(&config.username, config.password.expose_secret())?;
    session.command("SELECT \"INBOX\"")?;
    session.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))?;
    session.logout();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <abc@example.com>\r\n\
From: Alice <alice@example.com>\r\n\
Subject: Quarterly numbers\r\n\
Date: Tue, 1 Oct 2024 09:30:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Revenue is up. Please review before Friday.\r\n";

    // ── Sender allowlist ────────────────────────────────────────────

    #[test]
    fn allowlist_empty_denies_all() {
        assert!(!is_sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        let allowed = vec!["*".to_string()];
        assert!(is_sender_allowed(&allowed, "test@other.org"));
    }

    #[test]
    fn allowlist_exact_and_domain_entries() {
        let allowed = vec![
            "admin@company.com".to_string(),
            "@trusted.org".to_string(),
            "Partner.io".to_string(),
        ];
        assert!(is_sender_allowed(&allowed, "Admin@Company.com"));
        assert!(is_sender_allowed(&allowed, "anyone@trusted.org"));
        assert!(is_sender_allowed(&allowed, "ceo@partner.io"));
        assert!(!is_sender_allowed(&allowed, "random@evil.com"));
        assert!(!is_sender_allowed(&allowed, "x@notpartner.io"));
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn strip_html_keeps_words_apart() {
        assert_eq!(strip_html("<p>Hello</p><p>World</p>"), "Hello World");
        assert_eq!(strip_html(r#"<a href="x">Link</a>"#), "Link");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn message_becomes_inline_item() {
        let item = parse_mail(42, RAW).unwrap().into_item();
        assert_eq!(item.external_id, "abc@example.com");
        assert_eq!(item.meta("sender"), Some("alice@example.com"));
        assert_eq!(item.meta("uid"), Some("42"));
        assert_eq!(item.title(), "Quarterly numbers");
        let ContentRef::Inline(content) = &item.content_ref else {
            panic!("mail content should be inline");
        };
        assert!(content.starts_with("Subject: Quarterly numbers\nFrom: alice@example.com"));
        assert!(content.contains("Revenue is up."));
    }

    #[test]
    fn missing_message_id_falls_back_to_uid() {
        let raw = b"From: bob@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let item = parse_mail(7, raw).unwrap().into_item();
        assert_eq!(item.external_id, "uid-7");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let mut raw = b"From: bob@example.com\r\nSubject: long\r\n\r\n".to_vec();
        raw.extend(std::iter::repeat_n(b'x', MAX_BODY_CHARS + 500));
        let item = parse_mail(1, &raw).unwrap().into_item();
        let ContentRef::Inline(content) = &item.content_ref else {
            panic!("mail content should be inline");
        };
        let (headers, body) = content.split_once("\n\n").unwrap();
        assert_eq!(headers, "Subject: long\nFrom: bob@example.com");
        assert_eq!(body.chars().count(), MAX_BODY_CHARS);
        assert!(body.chars().all(|c| c == 'x'));
    }

    // ── Protocol helpers ────────────────────────────────────────────

    #[test]
    fn literal_sizes_are_detected() {
        assert_eq!(literal_len("* 3 FETCH (UID 9 BODY[] {1234}\r\n"), Some(1234));
        assert_eq!(literal_len("* 3 FETCH (FLAGS (\\Seen))\r\n"), None);
    }

    #[test]
    fn search_results_are_parsed() {
        let lines = vec!["* SEARCH 4 9 12\r\n".to_string(), "* OK done\r\n".to_string()];
        assert_eq!(parse_search(&lines), vec![4, 9, 12]);
        assert!(parse_search(&["* SEARCH\r\n".to_string()]).is_empty());
    }

    #[test]
    fn login_arguments_are_quoted() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }
}
