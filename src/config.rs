//! Configuration types, built from environment variables.
//!
//! Every source and sink section is optional: it is `None` when its
//! required variables are unset or its `*_ENABLED` flag is false.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::governor::{DEFAULT_AI_PERMITS, DEFAULT_POLL_PERMITS};
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::orchestrator::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS, OrchestratorConfig};
use crate::pipeline::summarizer::{ChunkFailurePolicy, PipelineConfig};
use crate::pipeline::types::SourceKind;
use crate::retry::RetryPolicy;
use crate::sources::watcher::default_cadence;

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_MINIMAX_BASE_URL: &str = "https://api.minimax.io/anthropic";
const DEFAULT_MINIMAX_MODEL: &str = "claude-3-haiku-20240307";

/// Top-level hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub lock_path: PathBuf,
    pub ledger_path: PathBuf,
    /// Pending entries older than this are reset to failed, at startup and
    /// by the periodic orphan sweep.
    pub pending_grace: Duration,
    /// How often the running hub sweeps orphaned pending entries.
    pub sweep_interval: Duration,
    /// Done entries older than this many days are pruned. Off when `None`.
    pub retention_days: Option<u32>,
    pub log_file: Option<PathBuf>,
    pub shutdown_grace: Duration,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryPolicy,
    pub ai_permits: usize,
    pub poll_permits: usize,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub sources: SourcesConfig,
    pub sinks: SinksConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SourcesConfig {
    pub drive: Option<DriveConfig>,
    pub mailbox: Option<MailboxConfig>,
    pub calendar: Option<CalendarConfig>,
    pub slack: Option<SlackSourceConfig>,
    pub telegram: Option<TelegramSourceConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct SinksConfig {
    pub telegram: Option<TelegramSinkConfig>,
    pub slack: Option<SlackSinkConfig>,
    pub notion: Option<NotionConfig>,
    pub webhook: Option<WebhookConfig>,
    pub email: Option<SmtpConfig>,
}

// ── Sources ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub folder_id: String,
    pub access_token: SecretString,
    pub cadence: Duration,
}

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Our own address; mail from it is skipped.
    pub self_address: String,
    /// Empty denies everyone, `*` allows everyone.
    pub allowed_senders: Vec<String>,
    pub cadence: Duration,
}

#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub calendar_id: String,
    pub access_token: SecretString,
    pub lookahead: Duration,
    pub cadence: Duration,
}

#[derive(Debug, Clone)]
pub struct SlackSourceConfig {
    pub bot_token: SecretString,
    pub channel_id: String,
    pub cadence: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramSourceConfig {
    pub bot_token: SecretString,
    /// Usernames or numeric ids; `*` allows everyone.
    pub allowed_users: Vec<String>,
    pub cadence: Duration,
}

// ── Sinks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TelegramSinkConfig {
    pub bot_token: SecretString,
    /// Chat that receives notices for non-chat items.
    pub owner_chat_id: String,
}

#[derive(Debug, Clone)]
pub struct SlackSinkConfig {
    pub bot_token: SecretString,
    pub channel_id: String,
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: SecretString,
    pub database_id: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub api_key: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
}

// ── Loading ─────────────────────────────────────────────────────────

/// Variable lookup with typed accessors.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    /// Trimmed, non-empty value.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.get(key).map(SecretString::from)
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{raw}': {e}"),
                })
            })
            .transpose()
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{v}' is not a boolean"),
                }),
            },
        }
    }

    /// Comma-separated list, entries trimmed, empties dropped.
    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        let key = "LEDGER_SWEEP_INTERVAL_SECS";
        let interval = self.secs(key, Duration::from_secs(5 * 60))?;
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "sweep interval must be at least one second".into(),
            });
        }
        Ok(interval)
    }

    fn cadence(&self, key: &str, kind: SourceKind) -> Result<Duration, ConfigError> {
        let cadence = self.secs(key, default_cadence(kind))?;
        if cadence.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "poll interval must be at least one second".into(),
            });
        }
        Ok(cadence)
    }
}

impl HubConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: vars.parse("RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: vars.millis("RETRY_BASE_DELAY_MS", defaults.base_delay)?,
            max_delay: vars.millis("RETRY_MAX_DELAY_MS", defaults.max_delay)?,
            jitter: vars.millis("RETRY_JITTER_MS", defaults.jitter)?,
        };

        Ok(Self {
            lock_path: PathBuf::from(vars.get_or("HUB_LOCK_PATH", "./automation_hub.lock")),
            ledger_path: PathBuf::from(vars.get_or("HUB_LEDGER_PATH", "./data/ledger.db")),
            pending_grace: vars.secs("LEDGER_PENDING_GRACE_SECS", Duration::from_secs(15 * 60))?,
            sweep_interval: vars.sweep_interval()?,
            retention_days: vars.parse_opt("LEDGER_RETENTION_DAYS")?,
            log_file: vars.get("HUB_LOG_FILE").map(PathBuf::from),
            shutdown_grace: vars.secs("HUB_SHUTDOWN_GRACE_SECS", Duration::from_secs(30))?,
            orchestrator: OrchestratorConfig {
                workers: vars.parse("HUB_WORKERS", DEFAULT_WORKERS)?,
                queue_capacity: vars.parse("HUB_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            },
            retry,
            ai_permits: vars.parse("AI_MAX_CONCURRENT_CALLS", DEFAULT_AI_PERMITS)?,
            poll_permits: vars.parse("SOURCE_POLL_CONCURRENCY", DEFAULT_POLL_PERMITS)?,
            pipeline: pipeline_config(&vars)?,
            llm: llm_config(&vars)?,
            sources: SourcesConfig {
                drive: drive_config(&vars)?,
                mailbox: mailbox_config(&vars)?,
                calendar: calendar_config(&vars)?,
                slack: slack_source_config(&vars)?,
                telegram: telegram_source_config(&vars)?,
            },
            sinks: SinksConfig {
                telegram: telegram_sink_config(&vars)?,
                slack: slack_sink_config(&vars)?,
                notion: notion_config(&vars)?,
                webhook: webhook_config(&vars)?,
                email: smtp_config(&vars)?,
            },
        })
    }
}

fn pipeline_config(vars: &Vars<'_>) -> Result<PipelineConfig, ConfigError> {
    let defaults = PipelineConfig::default();
    let chunk_chars: usize = vars.parse("SUMMARY_CHUNK_CHARS", defaults.chunk_chars)?;
    if chunk_chars < 100 {
        return Err(ConfigError::InvalidValue {
            key: "SUMMARY_CHUNK_CHARS".into(),
            message: format!("{chunk_chars} is too small (minimum 100)"),
        });
    }

    let stream_kinds = match vars.get("SUMMARY_STREAM_KINDS") {
        None => defaults.stream_kinds,
        Some(_) => vars
            .list("SUMMARY_STREAM_KINDS")
            .iter()
            .filter(|k| !k.eq_ignore_ascii_case("none"))
            .map(|k| {
                k.parse::<SourceKind>()
                    .map_err(|message| ConfigError::InvalidValue {
                        key: "SUMMARY_STREAM_KINDS".into(),
                        message,
                    })
            })
            .collect::<Result<HashSet<_>, _>>()?,
    };

    Ok(PipelineConfig {
        chunk_chars,
        chunk_workers: vars.parse("SUMMARY_CHUNK_WORKERS", defaults.chunk_workers)?,
        reduce_with_model: vars.flag("SUMMARY_REDUCE_WITH_MODEL", defaults.reduce_with_model)?,
        chunk_failure: vars.parse::<ChunkFailurePolicy>("SUMMARY_CHUNK_FAILURE", defaults.chunk_failure)?,
        stream_kinds,
    })
}

fn llm_config(vars: &Vars<'_>) -> Result<LlmConfig, ConfigError> {
    let backend: LlmBackend = vars.parse("LLM_PROVIDER", LlmBackend::Gemini)?;
    match backend {
        LlmBackend::Gemini => Ok(LlmConfig {
            backend,
            api_key: SecretString::from(vars.require("GEMINI_API_KEY")?),
            model: vars.get_or("GEMINI_MODEL", DEFAULT_GEMINI_MODEL),
            base_url: vars.get("GEMINI_BASE_URL"),
        }),
        LlmBackend::AnthropicCompatible => Ok(LlmConfig {
            backend,
            api_key: SecretString::from(vars.require("MINIMAX_API_TOKEN")?),
            model: vars.get_or("MINIMAX_MODEL", DEFAULT_MINIMAX_MODEL),
            base_url: Some(vars.get_or("MINIMAX_BASE_URL", DEFAULT_MINIMAX_BASE_URL)),
        }),
    }
}

fn drive_config(vars: &Vars<'_>) -> Result<Option<DriveConfig>, ConfigError> {
    if !vars.flag("DRIVE_ENABLED", true)? {
        return Ok(None);
    }
    let (Some(folder_id), Some(access_token)) =
        (vars.get("DRIVE_FOLDER_ID"), vars.secret("GOOGLE_ACCESS_TOKEN"))
    else {
        return Ok(None);
    };
    Ok(Some(DriveConfig {
        folder_id,
        access_token,
        cadence: vars.cadence("DRIVE_POLL_SECS", SourceKind::DriveFile)?,
    }))
}

fn mailbox_config(vars: &Vars<'_>) -> Result<Option<MailboxConfig>, ConfigError> {
    if !vars.flag("MAILBOX_ENABLED", true)? {
        return Ok(None);
    }
    let (Some(imap_host), Some(username), Some(password)) = (
        vars.get("EMAIL_IMAP_HOST"),
        vars.get("EMAIL_USERNAME"),
        vars.secret("EMAIL_PASSWORD"),
    ) else {
        return Ok(None);
    };
    Ok(Some(MailboxConfig {
        imap_port: vars.parse("EMAIL_IMAP_PORT", 993)?,
        self_address: vars.get("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone()),
        allowed_senders: vars.list("EMAIL_ALLOWED_SENDERS"),
        cadence: vars.cadence("MAILBOX_POLL_SECS", SourceKind::MailMessage)?,
        imap_host,
        username,
        password,
    }))
}

fn calendar_config(vars: &Vars<'_>) -> Result<Option<CalendarConfig>, ConfigError> {
    if !vars.flag("CALENDAR_ENABLED", true)? {
        return Ok(None);
    }
    let Some(access_token) = vars.secret("GOOGLE_ACCESS_TOKEN") else {
        return Ok(None);
    };
    let lookahead_mins: u64 = vars.parse("CALENDAR_LOOKAHEAD_MINS", 60)?;
    Ok(Some(CalendarConfig {
        calendar_id: vars.get_or("GOOGLE_CALENDAR_ID", "primary"),
        access_token,
        lookahead: Duration::from_secs(lookahead_mins * 60),
        cadence: vars.cadence("CALENDAR_POLL_SECS", SourceKind::CalendarEvent)?,
    }))
}

fn slack_source_config(vars: &Vars<'_>) -> Result<Option<SlackSourceConfig>, ConfigError> {
    if !vars.flag("SLACK_WATCH_ENABLED", true)? {
        return Ok(None);
    }
    let (Some(bot_token), Some(channel_id)) =
        (vars.secret("SLACK_BOT_TOKEN"), vars.get("SLACK_CHANNEL_ID"))
    else {
        return Ok(None);
    };
    Ok(Some(SlackSourceConfig {
        bot_token,
        channel_id,
        cadence: vars.cadence("SLACK_POLL_SECS", SourceKind::ChannelMessage)?,
    }))
}

fn telegram_source_config(vars: &Vars<'_>) -> Result<Option<TelegramSourceConfig>, ConfigError> {
    if !vars.flag("TELEGRAM_WATCH_ENABLED", true)? {
        return Ok(None);
    }
    let Some(bot_token) = vars.secret("TELEGRAM_BOT_TOKEN") else {
        return Ok(None);
    };
    let mut allowed_users = vars.list("TELEGRAM_ALLOWED_USERS");
    if allowed_users.is_empty()
        && let Some(owner) = vars.get("OWNER_ID")
    {
        allowed_users.push(owner);
    }
    Ok(Some(TelegramSourceConfig {
        bot_token,
        allowed_users,
        cadence: vars.cadence("TELEGRAM_POLL_SECS", SourceKind::ChatMessage)?,
    }))
}

fn telegram_sink_config(vars: &Vars<'_>) -> Result<Option<TelegramSinkConfig>, ConfigError> {
    if !vars.flag("TELEGRAM_NOTIFY_ENABLED", true)? {
        return Ok(None);
    }
    let (Some(bot_token), Some(owner_chat_id)) =
        (vars.secret("TELEGRAM_BOT_TOKEN"), vars.get("OWNER_ID"))
    else {
        return Ok(None);
    };
    Ok(Some(TelegramSinkConfig {
        bot_token,
        owner_chat_id,
    }))
}

fn slack_sink_config(vars: &Vars<'_>) -> Result<Option<SlackSinkConfig>, ConfigError> {
    if !vars.flag("SLACK_NOTIFY_ENABLED", true)? {
        return Ok(None);
    }
    let Some(bot_token) = vars.secret("SLACK_BOT_TOKEN") else {
        return Ok(None);
    };
    let Some(channel_id) = vars
        .get("SLACK_NOTIFY_CHANNEL_ID")
        .or_else(|| vars.get("SLACK_CHANNEL_ID"))
    else {
        return Ok(None);
    };
    Ok(Some(SlackSinkConfig {
        bot_token,
        channel_id,
    }))
}

fn notion_config(vars: &Vars<'_>) -> Result<Option<NotionConfig>, ConfigError> {
    if !vars.flag("NOTION_ENABLED", true)? {
        return Ok(None);
    }
    let (Some(token), Some(database_id)) =
        (vars.secret("NOTION_TOKEN"), vars.get("NOTION_DATABASE_ID"))
    else {
        return Ok(None);
    };
    Ok(Some(NotionConfig { token, database_id }))
}

fn webhook_config(vars: &Vars<'_>) -> Result<Option<WebhookConfig>, ConfigError> {
    if !vars.flag("N8N_ENABLED", true)? {
        return Ok(None);
    }
    let Some(url) = vars.get("N8N_WEBHOOK_URL") else {
        return Ok(None);
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            key: "N8N_WEBHOOK_URL".into(),
            message: "must be an http(s) URL".into(),
        });
    }
    Ok(Some(WebhookConfig {
        url,
        api_key: vars.secret("N8N_API_KEY"),
    }))
}

fn smtp_config(vars: &Vars<'_>) -> Result<Option<SmtpConfig>, ConfigError> {
    if !vars.flag("EMAIL_DIGEST_ENABLED", true)? {
        return Ok(None);
    }
    let (Some(username), Some(password), Some(to_address)) = (
        vars.get("EMAIL_USERNAME"),
        vars.secret("EMAIL_PASSWORD"),
        vars.get("EMAIL_DIGEST_TO"),
    ) else {
        return Ok(None);
    };
    let Some(host) = vars.get("EMAIL_SMTP_HOST").or_else(|| {
        vars.get("EMAIL_IMAP_HOST")
            .map(|imap| imap.replace("imap", "smtp"))
    }) else {
        return Ok(None);
    };
    Ok(Some(SmtpConfig {
        host,
        port: vars.parse("EMAIL_SMTP_PORT", 587)?,
        from_address: vars.get("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone()),
        username,
        password,
        to_address,
    }))
}
