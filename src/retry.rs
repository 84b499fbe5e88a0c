//! Retry/backoff controller wrapping every external call.
//!
//! ## Why a single controller?
//!
//! Every adapter (splitter, extractor, parser, writer) can fail the same four
//! ways, and the pipeline must react the same way regardless of which one
//! failed:
//!
//! | Class | Reaction |
//! |-------|----------|
//! | [`FailureClass::Transient`] | wait, retry up to `max_attempts` |
//! | [`FailureClass::RateLimited`] | as transient, waiting at least the provider's `retry_after` |
//! | [`FailureClass::ResourceExhausted`] | stop immediately, job pauses |
//! | [`FailureClass::Permanent`] | stop immediately, unit fails |
//! | [`FailureClass::Fatal`] | stop immediately, job aborts |
//!
//! The controller never retries a resource-exhaustion failure: the quota will
//! not come back within a backoff window, and hammering it only burns time.
//!
//! Sleeping goes through the [`Sleeper`] trait so tests can record the delay
//! schedule without waiting for it.

use crate::config::RetryConfig;
use crate::error::ToolError;
use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How a failed call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    /// Transient, with the provider's requested wait if it sent one.
    RateLimited { retry_after: Option<Duration> },
    ResourceExhausted,
    Permanent,
    Fatal,
}

/// Result of [`RetryController::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// Quota or credit used up. The caller should pause the job.
    Exhausted { reason: String, attempts: u32 },
    /// Permanent failure, or transient failures until the attempt budget or
    /// deadline ran out.
    PermanentFailure { reason: String, attempts: u32 },
    /// The collaborator is unusable; the caller should abort the job.
    Aborted { reason: String, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::PermanentFailure { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. } => *attempts,
        }
    }
}

impl RetryConfig {
    /// Delay before the `retry`-th retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Wait before the `retry`-th retry, stretched to the provider's
    /// `retry_after` (capped at `max_delay`) when it asked for longer.
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay(retry);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}

/// Abstraction over waiting between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ── Controller ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RetryController {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    pub fn new(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Invoke `call` until it succeeds or the policy gives up.
    ///
    /// `call` receives the 1-based attempt number. `classify` maps an error
    /// onto a [`FailureClass`]; calls that exceed the per-call timeout count
    /// as transient without consulting it.
    pub async fn invoke<T, E, F, Fut, C>(&self, label: &str, mut call: F, classify: C) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> FailureClass,
    {
        let started = tokio::time::Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        let mut retry_after = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.delay_with_hint(attempt - 1, retry_after.take());
                if let Some(deadline) = self.config.deadline {
                    if started.elapsed() + delay > deadline {
                        return RetryOutcome::PermanentFailure {
                            reason: format!("retry deadline of {deadline:?} reached: {last_error}"),
                            attempts: attempt - 1,
                        };
                    }
                }
                debug!("{label}: retry {} in {:?}", attempt - 1, delay);
                self.sleeper.sleep(delay).await;
            }

            let result = match self.config.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, call(attempt)).await {
                    Ok(r) => r.map_err(|e| (classify(&e), e.to_string())),
                    Err(_) => Err((
                        FailureClass::Transient,
                        ToolError::Timeout {
                            secs: limit.as_secs(),
                        }
                        .to_string(),
                    )),
                },
                None => call(attempt).await.map_err(|e| (classify(&e), e.to_string())),
            };

            let (class, message) = match result {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                }
                Err(failure) => failure,
            };

            match class {
                FailureClass::Transient => {
                    warn!("{label}: attempt {attempt}/{max_attempts} failed: {message}");
                    last_error = message;
                }
                FailureClass::RateLimited { retry_after: hint } => {
                    warn!("{label}: attempt {attempt}/{max_attempts} rate limited: {message}");
                    retry_after = hint;
                    last_error = message;
                }
                FailureClass::ResourceExhausted => {
                    return RetryOutcome::Exhausted {
                        reason: message,
                        attempts: attempt,
                    }
                }
                FailureClass::Permanent => {
                    return RetryOutcome::PermanentFailure {
                        reason: message,
                        attempts: attempt,
                    }
                }
                FailureClass::Fatal => {
                    return RetryOutcome::Aborted {
                        reason: message,
                        attempts: attempt,
                    }
                }
            }
        }

        RetryOutcome::PermanentFailure {
            reason: format!("gave up after {max_attempts} attempts: {last_error}"),
            attempts: max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            call_timeout: None,
            deadline: None,
        }
    }

    fn controller(config: RetryConfig) -> (RetryController, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        (RetryController::new(config, sleeper.clone()), sleeper)
    }

    #[test]
    fn delay_grows_geometrically_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(350));
        assert_eq!(p.delay(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_failures_use_every_attempt() {
        let (ctl, sleeper) = controller(policy(4));
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = ctl
            .invoke(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("503 service unavailable") }
                },
                |_| FailureClass::Transient,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome {
            RetryOutcome::PermanentFailure { reason, attempts } => {
                assert_eq!(attempts, 4);
                assert!(reason.contains("503"), "got: {reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350)
            ]
        );
    }

    #[tokio::test]
    async fn exhaustion_is_never_retried() {
        let (ctl, sleeper) = controller(policy(5));
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = ctl
            .invoke(
                "test",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("credit balance too low") }
                },
                |_| FailureClass::ResourceExhausted,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_after_transient_reports_attempts() {
        let (ctl, _) = controller(policy(3));
        let outcome = ctl
            .invoke(
                "test",
                |attempt| async move {
                    if attempt < 2 {
                        Err("connection reset")
                    } else {
                        Ok(attempt * 10)
                    }
                },
                |_| FailureClass::Transient,
            )
            .await;
        assert_eq!(
            outcome,
            RetryOutcome::Success {
                value: 20,
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn rate_limit_waits_for_retry_after_up_to_max_delay() {
        let (ctl, sleeper) = controller(policy(4));
        let errors = Mutex::new(vec![
            ToolError::Transient("502".into()),
            ToolError::RateLimited {
                message: "429".into(),
                retry_after_secs: None,
            },
            ToolError::RateLimited {
                message: "429".into(),
                retry_after_secs: Some(60),
            },
        ]);
        let outcome = ctl
            .invoke(
                "limited",
                |_| {
                    let next = errors.lock().unwrap().pop();
                    async move { next.map_or(Ok(()), Err) }
                },
                ToolError::class,
            )
            .await;

        assert_eq!(outcome.attempts(), 4);
        // 60 s hint capped at 350 ms; no hint keeps 200 ms; then plain backoff.
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![
                Duration::from_millis(350),
                Duration::from_millis(200),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn hint_never_shortens_backoff() {
        let p = policy(5);
        assert_eq!(p.delay_with_hint(1, Some(Duration::ZERO)), Duration::from_millis(100));
        assert_eq!(
            p.delay_with_hint(1, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(p.delay_with_hint(2, None), p.delay(2));
    }

    #[tokio::test]
    async fn fatal_aborts_and_permanent_stops() {
        let (ctl, _) = controller(policy(3));
        let aborted: RetryOutcome<()> = ctl
            .invoke("t", |_| async { Err("401") }, |_| FailureClass::Fatal)
            .await;
        assert!(matches!(aborted, RetryOutcome::Aborted { attempts: 1, .. }));

        let permanent: RetryOutcome<()> = ctl
            .invoke("t", |_| async { Err("bad table") }, |_| FailureClass::Permanent)
            .await;
        assert!(matches!(
            permanent,
            RetryOutcome::PermanentFailure { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_call_counts_as_transient() {
        let mut config = policy(2);
        config.call_timeout = Some(Duration::from_secs(5));
        let (ctl, sleeper) = controller(config);
        let outcome: RetryOutcome<()> = ctl
            .invoke(
                "slow",
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<(), String>(())
                },
                |_| FailureClass::Permanent,
            )
            .await;
        match outcome {
            RetryOutcome::PermanentFailure { reason, attempts } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("timed out"), "got: {reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sleeper.delays.lock().unwrap().len(), 1);
    }

    #[test]
    fn deadline_stops_before_attempt_budget() {
        let mut config = policy(10);
        config.deadline = Some(Duration::from_millis(250));
        let sleeper = Arc::new(TokioSleeper);
        let ctl = RetryController::new(config, sleeper);
        let calls = AtomicU32::new(0);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let outcome: RetryOutcome<()> = rt.block_on(ctl.invoke(
            "deadline",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("502") }
            },
            |_| FailureClass::Transient,
        ));

        // 100 ms + 200 ms of backoff would overshoot 250 ms.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match outcome {
            RetryOutcome::PermanentFailure { reason, attempts } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("deadline"), "got: {reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn block_on_helper_drives_controller() {
        let (ctl, _) = controller(policy(1));
        let outcome = tokio_test::block_on(ctl.invoke(
            "sync",
            |_| async { Ok::<_, String>("ok") },
            |_| FailureClass::Transient,
        ));
        assert_eq!(outcome.attempts(), 1);
    }
}
