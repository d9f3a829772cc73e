//! Automation hub: source watchers, a dedup ledger, an AI summarization
//! pipeline and fan-out to notification sinks.

pub mod config;
pub mod error;
pub mod governor;
pub mod http;
pub mod llm;
pub mod lock;
pub mod pipeline;
pub mod retry;
pub mod sinks;
pub mod sources;
pub mod store;
