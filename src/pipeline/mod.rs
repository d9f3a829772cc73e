//! Item processing pipeline.
//!
//! Every discovered item flows through:
//! 1. `Orchestrator::admit()`: ledger claim, then the bounded work queue
//! 2. `SourceClient::fetch_payload()`: source-specific I/O, retried
//! 3. `Summarizer`: local short-circuit, or chunk → parallel summarize → reduce
//! 4. Ledger `complete`, source acknowledgement
//! 5. `Dispatcher`: concurrent fan-out to every sink

pub mod chunker;
pub mod dispatcher;
pub mod orchestrator;
pub mod prompts;
pub mod summarizer;
pub mod types;

pub use dispatcher::Dispatcher;
pub use orchestrator::{Admission, Admit, Orchestrator, OrchestratorConfig, ShutdownReport};
pub use summarizer::{ChunkFailurePolicy, PipelineConfig, Summarizer};
pub use types::{ContentRef, Item, ItemIdentity, SinkDeliveryOutcome, SourceKind, SummaryResult};
