//! Persistence layer: the libSQL-backed dedup ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{Claim, LedgerEntry, LedgerStatus, LedgerStore};
