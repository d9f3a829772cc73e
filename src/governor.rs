//! Concurrency governor: shared permits bounding AI calls and source polls.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PipelineError;
use crate::pipeline::types::SourceKind;

/// Default cap on in-flight AI calls across all items.
pub const DEFAULT_AI_PERMITS: usize = 8;

/// Default number of concurrent polls per source.
pub const DEFAULT_POLL_PERMITS: usize = 1;

/// Hands out permits for AI calls and per-source polls.
///
/// Cloning is cheap; clones share the same semaphores.
#[derive(Debug, Clone)]
pub struct Governor {
    ai: Arc<Semaphore>,
    polls: Arc<HashMap<SourceKind, Arc<Semaphore>>>,
}

impl Default for Governor {
    fn default() -> Self {
        Self::new(DEFAULT_AI_PERMITS, DEFAULT_POLL_PERMITS)
    }
}

impl Governor {
    pub fn new(ai_permits: usize, poll_permits: usize) -> Self {
        let polls = SourceKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(Semaphore::new(poll_permits.max(1)))))
            .collect();
        Self {
            ai: Arc::new(Semaphore::new(ai_permits.max(1))),
            polls: Arc::new(polls),
        }
    }

    /// Wait for a slot to make one AI call.
    pub async fn ai_permit(&self) -> Result<OwnedSemaphorePermit, PipelineError> {
        Arc::clone(&self.ai)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Shutdown)
    }

    /// Wait for a slot to poll the given source.
    pub async fn poll_permit(&self, kind: SourceKind) -> Result<OwnedSemaphorePermit, PipelineError> {
        let semaphore = self.polls.get(&kind).ok_or(PipelineError::Shutdown)?;
        Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Shutdown)
    }

    /// AI permits currently free.
    pub fn ai_available(&self) -> usize {
        self.ai.available_permits()
    }

    /// Poll permits currently free for the given source.
    pub fn poll_available(&self, kind: SourceKind) -> usize {
        self.polls
            .get(&kind)
            .map(|semaphore| semaphore.available_permits())
            .unwrap_or(0)
    }

    /// Close every semaphore; waiters and later callers get `Shutdown`.
    pub fn close(&self) {
        self.ai.close();
        for semaphore in self.polls.values() {
            semaphore.close();
        }
    }
}
