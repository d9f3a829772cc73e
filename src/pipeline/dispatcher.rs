//! Fan-out dispatcher: delivers one result to every configured sink.
//!
//! Deliveries run concurrently and each is retried on its own. A failed
//! sink is recorded in its outcome and never holds up the others.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info};

use crate::pipeline::types::{Item, SinkDeliveryOutcome, SummaryResult};
use crate::retry::RetryPolicy;
use crate::sinks::Sink;

pub struct Dispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, retry: RetryPolicy) -> Self {
        Self { sinks, retry }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver to every sink. Outcomes are in configured sink order.
    pub async fn dispatch(&self, result: &SummaryResult) -> Vec<SinkDeliveryOutcome> {
        let outcomes = join_all(
            self.sinks
                .iter()
                .map(|sink| self.deliver_one(sink.as_ref(), result)),
        )
        .await;

        let failed = outcomes.iter().filter(|o| !o.ok).count();
        info!(
            item = %result.identity(),
            result_id = %result.id,
            delivered = outcomes.len() - failed,
            failed,
            "Dispatch complete"
        );
        outcomes
    }

    async fn deliver_one(&self, sink: &dyn Sink, result: &SummaryResult) -> SinkDeliveryOutcome {
        let label = format!("deliver {} to {}", result.identity(), sink.name());
        let mut attempts = 0;
        let delivery = self
            .retry
            .run(&label, || {
                attempts += 1;
                sink.deliver(result)
            })
            .await;

        match delivery {
            Ok(()) => {
                debug!(item = %result.identity(), sink = sink.name(), attempts, "Delivered");
                SinkDeliveryOutcome {
                    sink_name: sink.name().to_string(),
                    ok: true,
                    error: None,
                    attempts,
                }
            }
            Err(e) => {
                error!(
                    item = %result.identity(),
                    sink = sink.name(),
                    attempts,
                    error = %e,
                    "Sink delivery failed"
                );
                SinkDeliveryOutcome {
                    sink_name: sink.name().to_string(),
                    ok: false,
                    error: Some(e.to_string()),
                    attempts,
                }
            }
        }
    }

    /// Forward streamed text to every sink, best effort and without retry.
    pub async fn dispatch_partial(&self, item: &Item, text: &str) {
        let results = join_all(self.sinks.iter().map(|s| s.deliver_partial(item, text))).await;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                debug!(item = %item.identity(), sink = sink.name(), error = %e, "Partial delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::SinkError;
    use crate::pipeline::types::{ContentRef, SourceKind};

    enum Behaviour {
        Ok,
        Reject,
        Flaky,
        Slow(Duration),
    }

    struct RecordingSink {
        name: &'static str,
        behaviour: Behaviour,
        delivered: Mutex<Vec<String>>,
        partials: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                delivered: Mutex::new(Vec::new()),
                partials: Mutex::new(Vec::new()),
            })
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn deliver(&self, result: &SummaryResult) -> Result<(), SinkError> {
            match self.behaviour {
                Behaviour::Ok => {}
                Behaviour::Reject => {
                    return Err(SinkError::Rejected {
                        name: self.name.into(),
                        reason: "channel_not_found".into(),
                    });
                }
                Behaviour::Flaky => {
                    return Err(SinkError::Http {
                        name: self.name.into(),
                        status: 502,
                        body: String::new(),
                        retry_after: None,
                    });
                }
                Behaviour::Slow(d) => tokio::time::sleep(d).await,
            }
            self.delivered.lock().unwrap().push(result.text.clone());
            Ok(())
        }

        async fn deliver_partial(&self, _item: &Item, text: &str) -> Result<(), SinkError> {
            self.partials.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn sinks(list: &[&Arc<RecordingSink>]) -> Vec<Arc<dyn Sink>> {
        list.iter().map(|s| Arc::clone(s) as Arc<dyn Sink>).collect()
    }

    fn result() -> SummaryResult {
        let item = Item::new(SourceKind::DriveFile, "f1", ContentRef::Remote("f1".into()));
        SummaryResult::new(&item, "summary".into(), vec![])
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_does_not_block_others() {
        let a = RecordingSink::new("a", Behaviour::Ok);
        let b = RecordingSink::new("b", Behaviour::Reject);
        let c = RecordingSink::new("c", Behaviour::Ok);
        let dispatcher = Dispatcher::new(sinks(&[&a, &b, &c]), retry());

        let outcomes = dispatcher.dispatch(&result()).await;

        let names: Vec<_> = outcomes.iter().map(|o| o.sink_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(outcomes[0].ok && outcomes[2].ok);
        assert!(!outcomes[1].ok);
        assert_eq!(outcomes[1].attempts, 1, "permanent errors are not retried");
        assert!(outcomes[1].error.as_deref().unwrap().contains("channel_not_found"));
        assert_eq!(a.delivered(), vec!["summary"]);
        assert_eq!(c.delivered(), vec!["summary"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_failures_are_retried() {
        let flaky = RecordingSink::new("flaky", Behaviour::Flaky);
        let dispatcher = Dispatcher::new(sinks(&[&flaky]), retry());

        let outcomes = dispatcher.dispatch(&result()).await;

        assert!(!outcomes[0].ok);
        assert_eq!(outcomes[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deliveries_run_concurrently() {
        let slow1 = RecordingSink::new("slow1", Behaviour::Slow(Duration::from_secs(5)));
        let slow2 = RecordingSink::new("slow2", Behaviour::Slow(Duration::from_secs(5)));
        let dispatcher = Dispatcher::new(sinks(&[&slow1, &slow2]), retry());

        let start = tokio::time::Instant::now();
        let outcomes = dispatcher.dispatch(&result()).await;

        assert!(outcomes.iter().all(|o| o.ok));
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn partials_reach_every_sink() {
        let a = RecordingSink::new("a", Behaviour::Ok);
        let b = RecordingSink::new("b", Behaviour::Reject);
        let dispatcher = Dispatcher::new(sinks(&[&a, &b]), retry());
        let item = Item::new(SourceKind::ChatMessage, "1:2", ContentRef::Inline("hi".into()));

        dispatcher.dispatch_partial(&item, "typing…").await;

        assert_eq!(*a.partials.lock().unwrap(), vec!["typing…"]);
        assert_eq!(*b.partials.lock().unwrap(), vec!["typing…"]);
    }
}
