//! libSQL backend: async `LedgerStore` implementation.
//!
//! Supports local file and in-memory databases. Every state change is a
//! single statement, so the connection never holds a transaction open
//! across an await point.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{ItemIdentity, SourceKind};
use crate::store::migrations;
use crate::store::traits::{Claim, LedgerEntry, LedgerStatus, LedgerStore};

/// Reason recorded on entries reset by the startup sweep.
const STALE_PENDING_REASON: &str = "stale pending entry reset at startup";

/// libSQL ledger backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create ledger directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db).await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory ledger (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // File-backed ledgers see concurrent writers from every worker.
        // The pragma answers with a row, so it goes through `query`.
        match conn.query("PRAGMA busy_timeout = 5000", ()).await {
            Ok(mut rows) => {
                while let Ok(Some(_)) = rows.next().await {}
            }
            Err(e) => warn!(error = %e, "Could not set ledger busy timeout"),
        }

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp, so string order matches time order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn cutoff(age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    let at = Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    timestamp(at)
}

const LEDGER_COLUMNS: &str =
    "source_kind, external_id, status, result_ref, last_error, attempts, created_at, updated_at";

fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let kind: String = row.get(0).map_err(parse)?;
    let status: String = row.get(2).map_err(parse)?;
    let attempts: i64 = row.get(5).map_err(parse)?;
    let created: String = row.get(6).map_err(parse)?;
    let updated: String = row.get(7).map_err(parse)?;

    Ok(LedgerEntry {
        identity: ItemIdentity {
            source_kind: kind.parse::<SourceKind>().map_err(DatabaseError::Query)?,
            external_id: row.get(1).map_err(parse)?,
        },
        status: status.parse()?,
        result_ref: row.get(3).ok(),
        last_error: row.get(4).ok(),
        attempts: u32::try_from(attempts).unwrap_or(0),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

#[async_trait]
impl LedgerStore for LibSqlLedger {
    async fn claim(&self, identity: &ItemIdentity) -> Result<Claim, DatabaseError> {
        let now = timestamp(Utc::now());
        let changed = self
            .conn()
            .execute(
                "INSERT INTO ledger (source_kind, external_id, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 1, ?3, ?3)
                 ON CONFLICT(source_kind, external_id) DO UPDATE SET
                    status = 'pending',
                    attempts = ledger.attempts + 1,
                    updated_at = excluded.updated_at
                 WHERE ledger.status = 'failed'",
                params![identity.source_kind.as_str(), identity.external_id.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim: {e}")))?;

        let claim = if changed == 1 {
            Claim::Claimed
        } else {
            Claim::AlreadySeen
        };
        debug!(item = %identity, ?claim, "Ledger claim");
        Ok(claim)
    }

    async fn complete(&self, identity: &ItemIdentity, result_ref: &str) -> Result<(), DatabaseError> {
        let now = timestamp(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE ledger SET status = 'done', result_ref = ?3, last_error = NULL, updated_at = ?4
                 WHERE source_kind = ?1 AND external_id = ?2 AND status = 'pending'",
                params![
                    identity.source_kind.as_str(),
                    identity.external_id.as_str(),
                    result_ref,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::InvalidTransition {
                identity: identity.to_string(),
                target: LedgerStatus::Done.to_string(),
            });
        }
        debug!(item = %identity, result_ref, "Ledger entry done");
        Ok(())
    }

    async fn fail(&self, identity: &ItemIdentity, reason: &str) -> Result<(), DatabaseError> {
        let now = timestamp(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE ledger SET status = 'failed', last_error = ?3, updated_at = ?4
                 WHERE source_kind = ?1 AND external_id = ?2 AND status = 'pending'",
                params![
                    identity.source_kind.as_str(),
                    identity.external_id.as_str(),
                    reason,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::InvalidTransition {
                identity: identity.to_string(),
                target: LedgerStatus::Failed.to_string(),
            });
        }
        debug!(item = %identity, reason, "Ledger entry failed");
        Ok(())
    }

    async fn get(&self, identity: &ItemIdentity) -> Result<Option<LedgerEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger WHERE source_kind = ?1 AND external_id = ?2"
                ),
                params![identity.source_kind.as_str(), identity.external_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
        }
    }

    async fn stale_pending(&self, grace: Duration) -> Result<Vec<ItemIdentity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger
                     WHERE status = 'pending' AND updated_at < ?1
                     ORDER BY updated_at"
                ),
                params![cutoff(grace)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stale_pending: {e}")))?;

        let mut stale = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => stale.push(row_to_entry(&row)?.identity),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("stale_pending: {e}"))),
            }
        }
        Ok(stale)
    }

    async fn sweep_stale_pending(&self, grace: Duration) -> Result<usize, DatabaseError> {
        let now = timestamp(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE ledger SET status = 'failed', last_error = ?2, updated_at = ?3
                 WHERE status = 'pending' AND updated_at < ?1",
                params![cutoff(grace), STALE_PENDING_REASON, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sweep_stale_pending: {e}")))?;

        if changed > 0 {
            info!(count = changed, "Reset stale pending ledger entries to failed");
        }
        Ok(changed as usize)
    }

    async fn prune_done(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let keep = Duration::from_secs(u64::from(keep_days) * 24 * 60 * 60);
        let changed = self
            .conn()
            .execute(
                "DELETE FROM ledger WHERE status = 'done' AND updated_at < ?1",
                params![cutoff(keep)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_done: {e}")))?;

        if changed > 0 {
            info!(count = changed, keep_days, "Pruned done ledger entries");
        }
        Ok(changed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlLedger {
        LibSqlLedger::new_memory().await.unwrap()
    }

    fn mail(id: &str) -> ItemIdentity {
        ItemIdentity::new(SourceKind::MailMessage, id)
    }

    /// Push an entry's `updated_at` into the past.
    async fn age_entry(db: &LibSqlLedger, identity: &ItemIdentity, by: chrono::Duration) {
        let at = timestamp(Utc::now() - by);
        db.conn()
            .execute(
                "UPDATE ledger SET updated_at = ?3 WHERE source_kind = ?1 AND external_id = ?2",
                params![identity.source_kind.as_str(), identity.external_id.as_str(), at],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_pending_lists_only_old_pending_entries() {
        let db = test_db().await;
        let old = mail("old");
        let fresh = mail("fresh");
        let finished = mail("finished");
        for id in [&old, &fresh, &finished] {
            db.claim(id).await.unwrap();
        }
        db.complete(&finished, "r1").await.unwrap();
        age_entry(&db, &old, chrono::Duration::minutes(20)).await;
        age_entry(&db, &finished, chrono::Duration::minutes(20)).await;

        let stale = db.stale_pending(Duration::from_secs(15 * 60)).await.unwrap();

        assert_eq!(stale, vec![old]);
    }

    #[tokio::test]
    async fn claim_then_complete() {
        let db = test_db().await;
        let id = mail("m1");

        assert_eq!(db.claim(&id).await.unwrap(), Claim::Claimed);
        let entry = db.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        assert_eq!(entry.attempts, 1);

        db.complete(&id, "result-1").await.unwrap();
        let entry = db.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Done);
        assert_eq!(entry.result_ref.as_deref(), Some("result-1"));
    }

    #[tokio::test]
    async fn pending_and_done_are_already_seen() {
        let db = test_db().await;
        let id = mail("m1");

        assert_eq!(db.claim(&id).await.unwrap(), Claim::Claimed);
        assert_eq!(db.claim(&id).await.unwrap(), Claim::AlreadySeen);

        db.complete(&id, "r").await.unwrap();
        assert_eq!(db.claim(&id).await.unwrap(), Claim::AlreadySeen);
        assert_eq!(db.get(&id).await.unwrap().unwrap().status, LedgerStatus::Done);
    }

    #[tokio::test]
    async fn failed_entry_can_be_reclaimed() {
        let db = test_db().await;
        let id = mail("m1");

        db.claim(&id).await.unwrap();
        db.fail(&id, "provider down").await.unwrap();
        let entry = db.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("provider down"));

        assert_eq!(db.claim(&id).await.unwrap(), Claim::Claimed);
        let entry = db.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn same_external_id_in_other_kind_is_distinct() {
        let db = test_db().await;
        let a = ItemIdentity::new(SourceKind::DriveFile, "42");
        let b = ItemIdentity::new(SourceKind::ChatMessage, "42");

        assert_eq!(db.claim(&a).await.unwrap(), Claim::Claimed);
        assert_eq!(db.claim(&b).await.unwrap(), Claim::Claimed);
    }

    #[tokio::test]
    async fn transitions_out_of_done_are_rejected() {
        let db = test_db().await;
        let id = mail("m1");
        db.claim(&id).await.unwrap();
        db.complete(&id, "r").await.unwrap();

        let err = db.fail(&id, "late failure").await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
        let err = db.complete(&id, "again").await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));

        let entry = db.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Done);
        assert_eq!(entry.result_ref.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn complete_unknown_identity_is_rejected() {
        let db = test_db().await;
        let err = db.complete(&mail("ghost"), "r").await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
        assert!(db.get(&mail("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let db = Arc::new(test_db().await);
        let id = mail("contended");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let db = Arc::clone(&db);
            let id = id.clone();
            handles.push(tokio::spawn(async move { db.claim(&id).await.unwrap() }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == Claim::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn sweep_resets_only_stale_pending() {
        let db = test_db().await;
        let stale = mail("stale");
        let fresh = mail("fresh");
        let done = mail("done");

        for id in [&stale, &fresh, &done] {
            db.claim(id).await.unwrap();
        }
        db.complete(&done, "r").await.unwrap();
        age_entry(&db, &stale, chrono::Duration::hours(1)).await;
        age_entry(&db, &done, chrono::Duration::hours(1)).await;

        let swept = db.sweep_stale_pending(Duration::from_secs(15 * 60)).await.unwrap();
        assert_eq!(swept, 1);

        let entry = db.get(&stale).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some(STALE_PENDING_REASON));
        assert_eq!(db.get(&fresh).await.unwrap().unwrap().status, LedgerStatus::Pending);
        assert_eq!(db.get(&done).await.unwrap().unwrap().status, LedgerStatus::Done);

        // A swept entry is claimable again.
        assert_eq!(db.claim(&stale).await.unwrap(), Claim::Claimed);
    }

    #[tokio::test]
    async fn prune_removes_only_old_done_entries() {
        let db = test_db().await;
        let old_done = mail("old-done");
        let new_done = mail("new-done");
        let old_failed = mail("old-failed");

        for id in [&old_done, &new_done, &old_failed] {
            db.claim(id).await.unwrap();
        }
        db.complete(&old_done, "r").await.unwrap();
        db.complete(&new_done, "r").await.unwrap();
        db.fail(&old_failed, "x").await.unwrap();
        age_entry(&db, &old_done, chrono::Duration::days(40)).await;
        age_entry(&db, &old_failed, chrono::Duration::days(40)).await;

        assert_eq!(db.prune_done(30).await.unwrap(), 1);
        assert!(db.get(&old_done).await.unwrap().is_none());
        assert!(db.get(&new_done).await.unwrap().is_some());
        assert!(db.get(&old_failed).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_backed_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("ledger.db");
        let id = mail("persisted");

        {
            let db = LibSqlLedger::new_local(&path).await.unwrap();
            db.claim(&id).await.unwrap();
            db.complete(&id, "r").await.unwrap();
        }

        let db = LibSqlLedger::new_local(&path).await.unwrap();
        assert_eq!(db.claim(&id).await.unwrap(), Claim::AlreadySeen);
    }

    #[tokio::test]
    async fn file_backed_ledger_waits_on_busy_writers() {
        let dir = tempfile::tempdir().unwrap();
        let db = LibSqlLedger::new_local(&dir.path().join("ledger.db"))
            .await
            .unwrap();

        let mut rows = db.conn().query("PRAGMA busy_timeout", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 5000);
    }
}
