//! Per-source polling loop.
//!
//! Each enabled source gets one watcher task cycling
//! `Idle → Polling → Emitting → Sleeping → Idle` until cancelled.
//! A failed poll is logged and the watcher simply waits for its next turn.
//! The source's poll permit is held from listing until every listed item
//! has been admitted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::governor::Governor;
use crate::pipeline::orchestrator::{Admission, Admit};
use crate::pipeline::types::SourceKind;
use crate::retry::RetryPolicy;
use crate::sources::SourceClient;

/// Default poll cadence per source kind.
pub fn default_cadence(kind: SourceKind) -> Duration {
    match kind {
        SourceKind::ChatMessage => Duration::from_secs(10),
        SourceKind::ChannelMessage => Duration::from_secs(30),
        SourceKind::DriveFile => Duration::from_secs(60),
        SourceKind::MailMessage => Duration::from_secs(120),
        SourceKind::CalendarEvent => Duration::from_secs(300),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Polling,
    Emitting,
    Sleeping,
    Stopped,
}

pub struct Watcher {
    source: Arc<dyn SourceClient>,
    admit: Arc<dyn Admit>,
    governor: Governor,
    retry: RetryPolicy,
    cadence: Duration,
    state: watch::Sender<WatcherState>,
}

impl Watcher {
    pub fn new(
        source: Arc<dyn SourceClient>,
        admit: Arc<dyn Admit>,
        governor: Governor,
        retry: RetryPolicy,
        cadence: Duration,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            source,
            admit,
            governor,
            retry,
            cadence,
            state,
        }
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            source = self.source.name(),
            cadence_secs = self.cadence.as_secs(),
            "Watcher started"
        );

        while !cancel.is_cancelled() {
            self.poll_once(&cancel).await;

            self.set(WatcherState::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cadence) => {}
            }
            self.set(WatcherState::Idle);
        }

        self.set(WatcherState::Stopped);
        info!(source = self.source.name(), "Watcher stopped");
    }

    /// One poll: list candidates and admit each. Returns how many were queued.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> usize {
        let name = self.source.name();
        self.set(WatcherState::Polling);

        let Ok(_permit) = self.governor.poll_permit(self.source.kind()).await else {
            return 0;
        };
        let label = format!("poll {name}");
        let listed = tokio::select! {
            _ = cancel.cancelled() => return 0,
            listed = self.retry.run(&label, || self.source.list_candidates()) => listed,
        };

        let items = match listed {
            Ok(items) => items,
            Err(e) => {
                error!(source = name, error = %e, "Poll failed");
                return 0;
            }
        };

        self.set(WatcherState::Emitting);
        let mut queued = 0;
        for item in items {
            if cancel.is_cancelled() {
                break;
            }
            let identity = item.identity();
            match self.admit.admit(item).await {
                Ok(Admission::Queued) => queued += 1,
                Ok(Admission::AlreadySeen) => {
                    debug!(source = name, item = %identity, "Already seen");
                }
                Err(e) => error!(source = name, item = %identity, error = %e, "Admission failed"),
            }
        }

        if queued > 0 {
            info!(source = name, queued, "New items queued");
        }
        queued
    }

    fn set(&self, state: WatcherState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::error::{PipelineError, SourceError};
    use crate::pipeline::types::{ContentRef, Item};

    /// Fails the first `failures` polls, then lists the same two items forever.
    struct FlakySource {
        failures: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl SourceClient for FlakySource {
        fn kind(&self) -> SourceKind {
            SourceKind::ChannelMessage
        }

        fn name(&self) -> &str {
            "flaky"
        }

        async fn list_candidates(&self) -> Result<Vec<Item>, SourceError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(SourceError::AuthFailed {
                    name: "flaky".into(),
                    reason: "token expired".into(),
                });
            }
            Ok(vec![
                Item::new(SourceKind::ChannelMessage, "C1:1", ContentRef::Inline("a".into())),
                Item::new(SourceKind::ChannelMessage, "C1:2", ContentRef::Inline("b".into())),
            ])
        }
    }

    #[derive(Default)]
    struct SeenSet {
        seen: Mutex<HashSet<String>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Admit for SeenSet {
        async fn admit(&self, item: Item) -> Result<Admission, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.seen.lock().unwrap().insert(item.external_id) {
                Ok(Admission::Queued)
            } else {
                Ok(Admission::AlreadySeen)
            }
        }
    }

    fn watcher(failures: u32, admit: Arc<SeenSet>) -> (Watcher, Arc<FlakySource>) {
        let source = Arc::new(FlakySource {
            failures,
            polls: AtomicU32::new(0),
        });
        let w = Watcher::new(
            source.clone(),
            admit,
            Governor::default(),
            RetryPolicy::no_retry(),
            Duration::from_secs(30),
        );
        (w, source)
    }

    #[tokio::test]
    async fn failed_poll_admits_nothing() {
        let admit = Arc::new(SeenSet::default());
        let (w, _) = watcher(1, admit.clone());
        let cancel = CancellationToken::new();

        assert_eq!(w.poll_once(&cancel).await, 0);
        assert_eq!(admit.calls.load(Ordering::SeqCst), 0);
        assert_eq!(w.poll_once(&cancel).await, 2);
        assert_eq!(w.poll_once(&cancel).await, 0, "repeats are already seen");
        assert_eq!(admit.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_failures_and_stops_on_cancel() {
        let admit = Arc::new(SeenSet::default());
        let (w, source) = watcher(2, admit.clone());
        let mut state = w.state();
        let cancel = CancellationToken::new();
        let handle = w.spawn(cancel.clone());

        // Two failed polls, then a successful one, each 30s apart.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(source.polls.load(Ordering::SeqCst) >= 3);
        assert_eq!(admit.seen.lock().unwrap().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
        state.changed().await.ok();
        assert_eq!(*state.borrow(), WatcherState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_polls() {
        let admit = Arc::new(SeenSet::default());
        let (w, source) = watcher(0, admit);
        let mut state = w.state();
        let cancel = CancellationToken::new();
        let handle = w.spawn(cancel.clone());

        state.wait_for(|s| *s == WatcherState::Sleeping).await.unwrap();
        assert_eq!(source.polls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.polls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Records the free poll permits for its source at each admission.
    struct PermitObserver {
        governor: Governor,
        free_during_admit: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Admit for PermitObserver {
        async fn admit(&self, _item: Item) -> Result<Admission, PipelineError> {
            let free = self.governor.poll_available(SourceKind::ChannelMessage);
            self.free_during_admit.lock().unwrap().push(free);
            Ok(Admission::Queued)
        }
    }

    #[tokio::test]
    async fn poll_permit_is_held_until_items_are_admitted() {
        let governor = Governor::new(4, 1);
        let observer = Arc::new(PermitObserver {
            governor: governor.clone(),
            free_during_admit: Mutex::new(Vec::new()),
        });
        let source = Arc::new(FlakySource {
            failures: 0,
            polls: AtomicU32::new(0),
        });
        let w = Watcher::new(
            source,
            observer.clone(),
            governor.clone(),
            RetryPolicy::no_retry(),
            Duration::from_secs(30),
        );

        assert_eq!(w.poll_once(&CancellationToken::new()).await, 2);
        assert_eq!(*observer.free_during_admit.lock().unwrap(), vec![0, 0]);
        assert_eq!(governor.poll_available(SourceKind::ChannelMessage), 1);
    }

    #[test]
    fn cadences_follow_source_kind() {
        assert_eq!(default_cadence(SourceKind::ChatMessage), Duration::from_secs(10));
        assert_eq!(default_cadence(SourceKind::CalendarEvent), Duration::from_secs(300));
    }
}
