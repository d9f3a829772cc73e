//! Retry policy: bounded retries with exponential backoff and jitter.
//!
//! Any fallible async operation can be wrapped with [`RetryPolicy::run`].
//! The operation's error decides whether another attempt is worth making
//! through the [`Classify`] trait:
//!
//! - `Transient` → sleep and retry, up to `max_attempts` tries in total
//! - `Permanent` → fail immediately
//!
//! Delays grow as `base * 2^(n-1)`, are capped at `max_delay`, carry up to
//! `jitter` of random slack, honour a provider retry-after hint as a floor,
//! and never shrink from one retry to the next.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{LlmError, SinkError, SourceError};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    /// Retry after backoff; `retry_after` is a provider-supplied floor.
    Transient { retry_after: Option<Duration> },
    /// Retrying cannot help.
    Permanent,
}

impl Transience {
    /// Classify an HTTP status code.
    ///
    /// 408, 425, 429 and 5xx are transient; anything else is permanent.
    pub fn for_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            408 | 425 | 429 | 500..=599 => Transience::Transient { retry_after },
            _ => Transience::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Transience::Transient { .. })
    }
}

/// Error classification used by the retry policy.
pub trait Classify {
    fn transience(&self) -> Transience;
}

/// Failure surfaced by [`RetryPolicy::run`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("permanent failure: {0}")]
    Permanent(#[source] E),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Number of attempts that were made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent(_) => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the computed backoff (a retry-after hint may exceed it).
    pub max_delay: Duration,
    /// Upper bound of the random slack added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Compute the delay before retry number `retry` (1-based).
    pub fn backoff(
        &self,
        retry: u32,
        previous: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let exponential = self.base_delay.saturating_mul(1u32 << shift);
        let mut delay = exponential.min(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            let slack = rand::thread_rng().gen_range(0..=jitter_ms);
            delay = (delay + Duration::from_millis(slack)).min(self.max_delay);
        }

        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        delay.max(previous)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Classify + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut previous = Duration::ZERO;
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retry_after = match err.transience() {
                Transience::Permanent => return Err(RetryError::Permanent(err)),
                Transience::Transient { retry_after } => retry_after,
            };

            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.backoff(attempt, previous, retry_after);
            warn!(
                op = label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            previous = delay;
            attempt += 1;
        }
    }
}

// ── Classification of the hub's error types ─────────────────────────

impl Classify for LlmError {
    fn transience(&self) -> Transience {
        match self {
            LlmError::RequestFailed { .. } => Transience::Transient { retry_after: None },
            LlmError::RateLimited { retry_after, .. } => Transience::Transient {
                retry_after: *retry_after,
            },
            LlmError::Http { status, .. } => Transience::for_status(*status, None),
            LlmError::InvalidResponse { .. } | LlmError::AuthFailed { .. } | LlmError::Json(_) => {
                Transience::Permanent
            }
        }
    }
}

impl Classify for SourceError {
    fn transience(&self) -> Transience {
        match self {
            SourceError::RequestFailed { .. } | SourceError::Imap(_) => {
                Transience::Transient { retry_after: None }
            }
            SourceError::Http {
                status,
                retry_after,
                ..
            } => Transience::for_status(*status, *retry_after),
            SourceError::AuthFailed { .. }
            | SourceError::Malformed { .. }
            | SourceError::Unsupported { .. } => Transience::Permanent,
        }
    }
}

impl Classify for SinkError {
    fn transience(&self) -> Transience {
        match self {
            SinkError::RequestFailed { .. } => Transience::Transient { retry_after: None },
            SinkError::RateLimited { retry_after, .. } => Transience::Transient {
                retry_after: *retry_after,
            },
            SinkError::Http {
                status,
                retry_after,
                ..
            } => Transience::for_status(*status, *retry_after),
            SinkError::Rejected { .. } | SinkError::Misconfigured { .. } => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("slow down")]
        Throttled(Duration),
        #[error("broken")]
        Broken,
    }

    impl Classify for TestError {
        fn transience(&self) -> Transience {
            match self {
                TestError::Flaky => Transience::Transient { retry_after: None },
                TestError::Throttled(d) => Transience::Transient {
                    retry_after: Some(*d),
                },
                TestError::Broken => Transience::Permanent,
            }
        }
    }

    fn policy(jitter: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter,
        }
    }

    /// Run a policy against an always-failing op, returning the gaps
    /// between consecutive attempts.
    async fn gaps_for(policy: &RetryPolicy, error: fn() -> TestError) -> (RetryError<TestError>, Vec<Duration>) {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&stamps);
        let err = policy
            .run("test", move || {
                let s = Arc::clone(&s);
                async move {
                    s.lock().await.push(Instant::now());
                    Err::<(), _>(error())
                }
            })
            .await
            .unwrap_err();
        let stamps = stamps.lock().await;
        let gaps = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        (err, gaps)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhausts_after_max_attempts() {
        let (err, gaps) = gaps_for(&policy(Duration::ZERO), || TestError::Flaky).await;

        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 4);
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_delays_never_decrease() {
        let mut p = policy(Duration::from_millis(900));
        p.max_attempts = 8;
        p.max_delay = Duration::from_secs(5);

        let (err, gaps) = gaps_for(&p, || TestError::Flaky).await;

        assert_eq!(err.attempts(), 8);
        assert_eq!(gaps.len(), 7);
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "backoff shrank: {:?}", gaps);
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_fails_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = policy(Duration::ZERO)
            .run("test", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Broken) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Permanent(TestError::Broken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let value = policy(Duration::ZERO)
            .run("test", move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::Flaky)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_a_floor() {
        let mut p = policy(Duration::ZERO);
        p.max_attempts = 2;
        let (_, gaps) = gaps_for(&p, || TestError::Throttled(Duration::from_secs(45))).await;

        assert_eq!(gaps, vec![Duration::from_secs(45)]);
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy(Duration::ZERO);
        assert_eq!(p.backoff(10, Duration::ZERO, None), Duration::from_secs(30));
    }

    #[test]
    fn status_classification() {
        assert!(Transience::for_status(429, None).is_transient());
        assert!(Transience::for_status(503, None).is_transient());
        assert!(Transience::for_status(408, None).is_transient());
        assert_eq!(Transience::for_status(401, None), Transience::Permanent);
        assert_eq!(Transience::for_status(404, None), Transience::Permanent);
    }

    #[test]
    fn llm_errors_classify() {
        let limited = LlmError::RateLimited {
            provider: "gemini".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            limited.transience(),
            Transience::Transient {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        let auth = LlmError::AuthFailed {
            provider: "gemini".into(),
        };
        assert_eq!(auth.transience(), Transience::Permanent);
    }
}
