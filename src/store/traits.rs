//! `LedgerStore` trait: the async interface to the dedup ledger.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::ItemIdentity;

/// Processing status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    /// Claimed, processing in flight.
    Pending,
    /// Processed; never claimed again.
    Done,
    /// Processing failed; the next claim may retry it.
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Done => "done",
            LedgerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LedgerStatus::Pending),
            "done" => Ok(LedgerStatus::Done),
            "failed" => Ok(LedgerStatus::Failed),
            other => Err(DatabaseError::Query(format!("unknown ledger status '{other}'"))),
        }
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub identity: ItemIdentity,
    pub status: LedgerStatus,
    pub result_ref: Option<String>,
    pub last_error: Option<String>,
    /// Number of successful claims.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of [`LedgerStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns processing of this item.
    Claimed,
    /// The item is pending or done elsewhere.
    AlreadySeen,
}

/// Durable record of which items were observed and their status.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically claim an identity: a new identity or a `failed` one
    /// becomes `pending`. Exactly one concurrent caller wins.
    async fn claim(&self, identity: &ItemIdentity) -> Result<Claim, DatabaseError>;

    /// `pending` → `done`.
    async fn complete(&self, identity: &ItemIdentity, result_ref: &str) -> Result<(), DatabaseError>;

    /// `pending` → `failed`, keeping the reason.
    async fn fail(&self, identity: &ItemIdentity, reason: &str) -> Result<(), DatabaseError>;

    async fn get(&self, identity: &ItemIdentity) -> Result<Option<LedgerEntry>, DatabaseError>;

    /// Identities of `pending` entries untouched for longer than `grace`.
    async fn stale_pending(&self, grace: Duration) -> Result<Vec<ItemIdentity>, DatabaseError>;

    /// Reset `pending` entries untouched for longer than `grace` to `failed`.
    async fn sweep_stale_pending(&self, grace: Duration) -> Result<usize, DatabaseError>;

    /// Delete `done` entries older than `keep_days`.
    async fn prune_done(&self, keep_days: u32) -> Result<usize, DatabaseError>;
}
