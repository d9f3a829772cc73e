//! Orchestrator: admission, the bounded work queue and the worker pool.
//!
//! Flow per item:
//! 1. `admit`: claim in the ledger, then enqueue
//! 2. A worker fetches the payload (retried) and runs the summarizer
//! 3. Ledger `complete` (or `fail`), then source acknowledgement
//! 4. Fan-out to sinks
//!
//! While running, a sweeper resets `pending` entries older than the grace
//! period that this process does not own (left by a crashed run) to
//! `failed`, so the next poll can claim them again.
//!
//! On shutdown admission closes, queued items that never started are
//! reset to `failed`, running items get a grace period, and whatever is
//! still running afterwards is aborted and reset to `failed`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::summarizer::Summarizer;
use crate::pipeline::types::{Item, ItemIdentity, SourceKind, SummaryResult};
use crate::retry::RetryPolicy;
use crate::sources::SourceClient;
use crate::store::{Claim, LedgerStore};

/// Default number of items processed concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// Default capacity of the work queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Capacity of the per-item partial-text channel.
const PARTIAL_CHANNEL_CAPACITY: usize = 32;

const ORPHAN_REASON: &str = "pending entry orphaned by an earlier run";

/// Outcome of [`Orchestrator::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    AlreadySeen,
}

/// Entry point watchers hand discovered items to.
#[async_trait]
pub trait Admit: Send + Sync {
    async fn admit(&self, item: Item) -> Result<Admission, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// What [`Orchestrator::shutdown`] had to clean up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued items that never started.
    pub drained: usize,
    /// Running items cancelled after the grace period.
    pub aborted: usize,
}

pub struct Orchestrator {
    ledger: Arc<dyn LedgerStore>,
    sources: HashMap<SourceKind, Arc<dyn SourceClient>>,
    summarizer: Arc<Summarizer>,
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
    config: OrchestratorConfig,
    sender: Mutex<Option<mpsc::Sender<Item>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Item>>,
    /// Admitted by this process and not yet finished, queued or running.
    owned: tokio::sync::Mutex<HashSet<ItemIdentity>>,
    in_flight: tokio::sync::Mutex<HashSet<ItemIdentity>>,
    workers: Mutex<JoinSet<()>>,
    stop: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        sources: Vec<Arc<dyn SourceClient>>,
        summarizer: Arc<Summarizer>,
        dispatcher: Arc<Dispatcher>,
        retry: RetryPolicy,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let sources = sources.into_iter().map(|s| (s.kind(), s)).collect();
        Arc::new(Self {
            ledger,
            sources,
            summarizer,
            dispatcher,
            retry,
            config,
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            owned: tokio::sync::Mutex::new(HashSet::new()),
            in_flight: tokio::sync::Mutex::new(HashSet::new()),
            workers: Mutex::new(JoinSet::new()),
            stop: CancellationToken::new(),
        })
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut workers) = self.workers.lock() else {
            error!("Worker set lock poisoned, cannot start workers");
            return;
        };
        for worker_id in 0..self.config.workers.max(1) {
            let this = Arc::clone(self);
            workers.spawn(async move { this.worker_loop(worker_id).await });
        }
        info!(
            workers = self.config.workers.max(1),
            queue_capacity = self.config.queue_capacity,
            "Orchestrator started"
        );
    }

    /// Claim the item and queue it for processing.
    ///
    /// Waits for queue space, so a full queue slows the calling watcher.
    pub async fn admit(&self, item: Item) -> Result<Admission, PipelineError> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(PipelineError::QueueClosed)?;

        let identity = item.identity();
        if self.ledger.claim(&identity).await? == Claim::AlreadySeen {
            return Ok(Admission::AlreadySeen);
        }
        self.owned.lock().await.insert(identity.clone());

        if sender.send(item).await.is_err() {
            self.release(&identity, "hub shut down before processing").await;
            return Err(PipelineError::QueueClosed);
        }
        debug!(item = %identity, "Item queued");
        Ok(Admission::Queued)
    }

    /// Identities currently being processed.
    pub async fn in_flight(&self) -> Vec<ItemIdentity> {
        self.in_flight.lock().await.iter().cloned().collect()
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker = worker_id, "Worker started");
        loop {
            let next = {
                let mut rx = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = next else { break };
            self.process_item(item).await;
        }
        debug!(worker = worker_id, "Worker stopped");
    }

    async fn process_item(&self, item: Item) {
        let identity = item.identity();
        self.in_flight.lock().await.insert(identity.clone());
        info!(item = %identity, title = %item.title(), "Processing item");

        match self.summarize_item(&item).await {
            Ok(result) => self.finish(&item, result).await,
            Err(e) => {
                error!(item = %identity, error = %e, "Item processing failed");
                self.fail_entry(&identity, &e.to_string()).await;
            }
        }

        self.in_flight.lock().await.remove(&identity);
        self.owned.lock().await.remove(&identity);
    }

    async fn summarize_item(&self, item: &Item) -> Result<SummaryResult, PipelineError> {
        let identity = item.identity();
        let source = self.sources.get(&item.source_kind).ok_or_else(|| {
            PipelineError::Fetch(format!("no source client for {}", item.source_kind))
        })?;

        let content = self
            .retry
            .run(&format!("fetch {identity}"), || source.fetch_payload(item))
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;

        if !self.summarizer.streams(item.source_kind) {
            return self.summarizer.summarize(item, &content).await;
        }

        let (tx, mut rx) = mpsc::channel::<String>(PARTIAL_CHANNEL_CAPACITY);
        let forward = async {
            while let Some(text) = rx.recv().await {
                self.dispatcher.dispatch_partial(item, &text).await;
            }
        };
        let (result, ()) = tokio::join!(
            self.summarizer.summarize_streaming(item, &content, tx),
            forward
        );
        result
    }

    /// Record success, acknowledge the source, fan out.
    async fn finish(&self, item: &Item, result: SummaryResult) {
        let identity = item.identity();
        if let Err(e) = self.ledger.complete(&identity, &result.id.to_string()).await {
            // Left pending; the orphan sweep makes it retryable.
            error!(item = %identity, error = %e, "Failed to mark item done, skipping dispatch");
            return;
        }
        info!(
            item = %identity,
            result_id = %result.id,
            safety_blocked = result.safety_blocked,
            short_circuited = result.short_circuited,
            "Item summarized"
        );

        if let Some(source) = self.sources.get(&item.source_kind)
            && let Err(e) = source.acknowledge(item).await
        {
            warn!(item = %identity, error = %e, "Source acknowledgement failed");
        }

        self.dispatcher.dispatch(&result).await;
    }

    async fn fail_entry(&self, identity: &ItemIdentity, reason: &str) {
        if let Err(e) = self.ledger.fail(identity, reason).await {
            warn!(item = %identity, error = %e, "Could not mark ledger entry failed");
        }
    }

    /// Fail an entry this process owned and forget it.
    async fn release(&self, identity: &ItemIdentity, reason: &str) {
        self.fail_entry(identity, reason).await;
        self.owned.lock().await.remove(identity);
    }

    /// Reset stale `pending` entries this process does not own to
    /// `failed`. Returns how many were reset.
    pub async fn sweep_orphans(&self, grace: Duration) -> Result<usize, PipelineError> {
        let stale = self.ledger.stale_pending(grace).await?;
        let owned = self.owned.lock().await.clone();

        let mut swept = 0;
        for identity in stale.iter().filter(|id| !owned.contains(id)) {
            match self.ledger.fail(identity, ORPHAN_REASON).await {
                Ok(()) => swept += 1,
                // Finished or reclaimed since the listing.
                Err(DatabaseError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if swept > 0 {
            warn!(swept, "Reset orphaned pending ledger entries to failed");
        }
        Ok(swept)
    }

    /// Run [`Orchestrator::sweep_orphans`] every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        grace: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = this.sweep_orphans(grace).await {
                    error!(error = %e, "Orphan sweep failed");
                }
            }
            debug!("Orphan sweeper stopped");
        })
    }

    /// Stop admission, drain the queue and wind down the workers.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!(grace_secs = grace.as_secs(), "Orchestrator shutting down");
        let mut report = ShutdownReport::default();

        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        self.stop.cancel();

        {
            let mut rx = self.receiver.lock().await;
            rx.close();
            while let Some(item) = rx.recv().await {
                self.release(&item.identity(), "hub shut down before processing")
                    .await;
                report.drained += 1;
            }
        }

        let mut workers = match self.workers.lock() {
            Ok(mut set) => std::mem::take(&mut *set),
            Err(_) => JoinSet::new(),
        };

        let finished = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !finished {
            warn!("Grace period elapsed, cancelling in-flight items");
            workers.abort_all();
            while workers.join_next().await.is_some() {}

            let stranded: Vec<ItemIdentity> = self.in_flight.lock().await.drain().collect();
            for identity in stranded {
                self.release(&identity, "cancelled at shutdown").await;
                report.aborted += 1;
            }
        }

        info!(
            drained = report.drained,
            aborted = report.aborted,
            "Orchestrator stopped"
        );
        report
    }
}

#[async_trait]
impl Admit for Orchestrator {
    async fn admit(&self, item: Item) -> Result<Admission, PipelineError> {
        Orchestrator::admit(self, item).await
    }
}
