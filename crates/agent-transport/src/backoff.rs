//! Retry loops with exponential and fixed delays.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first attempt in milliseconds.
    pub init_delay_ms: u64,
    /// Delay after the first failure in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied after each failure.
    pub factor: f64,
    /// Total number of attempts.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_delay_ms: 0,
            base_delay_ms: 1000,
            max_delay_ms: 32_000,
            factor: 2.0,
            max_retries: 5,
        }
    }
}

impl BackoffConfig {
    /// Attempt count treated as "retry until cancelled".
    pub const UNBOUNDED: u32 = u32::MAX;

    /// Constant `interval` between attempts, retrying until cancelled.
    pub fn fixed(interval: Duration) -> Self {
        let interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
        Self {
            init_delay_ms: 0,
            base_delay_ms: interval_ms,
            max_delay_ms: interval_ms,
            factor: 1.0,
            max_retries: Self::UNBOUNDED,
        }
    }

    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay following `current`, grown by `factor` and clamped to the max.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let max = self.max_delay();
        Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
            .map_or(max, |next| next.min(max))
    }
}

/// Waits between attempts.
///
/// Production code uses [`TokioSleeper`]; tests inject one that records the
/// requested delays and returns immediately.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `delay`. Returns `false` if the wait was interrupted and the
    /// caller should give up.
    async fn sleep(&self, delay: Duration) -> bool;
}

/// Real timer that is cut short when its token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct TokioSleeper {
    cancel: CancellationToken,
}

impl TokioSleeper {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Run `operation` until it reports success or `config.max_retries` attempts
/// have failed.
///
/// `operation` receives the zero-based attempt number and the delay slept
/// before that attempt. Returns `true` on the first success and `false` once
/// attempts are exhausted, `cancel` fires or the sleeper is interrupted.
/// `cancel` is checked before every attempt and raced against every sleep,
/// whatever the sleeper does.
pub async fn try_with_exponential_backoff<F, Fut>(
    config: &BackoffConfig,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut operation: F,
) -> bool
where
    F: FnMut(u32, Duration) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut preceding = config.init_delay();
    if !preceding.is_zero() && !sleep_unless_cancelled(sleeper, cancel, preceding).await {
        return false;
    }

    let mut delay = config.base_delay().min(config.max_delay());
    for attempt in 0..config.max_retries {
        if cancel.is_cancelled() {
            trace!(attempt, "Cancelled before attempt");
            return false;
        }
        if operation(attempt, preceding).await {
            return true;
        }

        if attempt + 1 >= config.max_retries {
            break;
        }

        trace!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
        if !sleep_unless_cancelled(sleeper, cancel, delay).await {
            return false;
        }

        preceding = delay;
        delay = config.next_delay(delay);
    }

    false
}

async fn sleep_unless_cancelled(
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    delay: Duration,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        slept = sleeper.sleep(delay) => slept && !cancel.is_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) -> bool {
            self.delays.lock().push(delay);
            true
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.init_delay_ms, 0);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 32_000);
        assert_eq!(config.factor, 2.0);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_next_delay_is_clamped() {
        let config = BackoffConfig::default();
        assert_eq!(config.next_delay(ms(1000)), ms(2000));
        assert_eq!(config.next_delay(ms(20_000)), ms(32_000));
        assert_eq!(config.next_delay(Duration::MAX), ms(32_000));
    }

    #[tokio::test]
    async fn test_always_failing_runs_max_retries_times() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);

        let result = try_with_exponential_backoff(&BackoffConfig::default(), &sleeper, &CancellationToken::new(), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;

        assert!(!result);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // No sleep after the final attempt.
        assert_eq!(
            *sleeper.delays.lock(),
            vec![ms(1000), ms(2000), ms(4000), ms(8000)]
        );
    }

    #[tokio::test]
    async fn test_success_on_third_attempt_stops() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);

        let result = try_with_exponential_backoff(&BackoffConfig::default(), &sleeper, &CancellationToken::new(), |attempt, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { attempt == 2 }
        })
        .await;

        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_immediate_success_never_sleeps() {
        let sleeper = RecordingSleeper::default();
        let result =
            try_with_exponential_backoff(&BackoffConfig::default(), &sleeper, &CancellationToken::new(), |_, _| async { true })
                .await;

        assert!(result);
        assert!(sleeper.delays.lock().is_empty());
    }

    #[tokio::test]
    async fn test_operation_sees_preceding_delay() {
        let sleeper = RecordingSleeper::default();
        let config = BackoffConfig {
            init_delay_ms: 250,
            ..BackoffConfig::default()
        };
        let seen = Mutex::new(Vec::new());

        try_with_exponential_backoff(&config, &sleeper, &CancellationToken::new(), |attempt, delay| {
            seen.lock().push((attempt, delay));
            async { false }
        })
        .await;

        assert_eq!(
            *seen.lock(),
            vec![
                (0, ms(250)),
                (1, ms(1000)),
                (2, ms(2000)),
                (3, ms(4000)),
                (4, ms(8000)),
            ]
        );
        assert_eq!(sleeper.delays.lock()[0], ms(250));
    }

    #[tokio::test]
    async fn test_no_sleep_exceeds_max_delay() {
        let sleeper = RecordingSleeper::default();
        let config = BackoffConfig {
            base_delay_ms: 700,
            max_delay_ms: 5000,
            factor: 3.0,
            max_retries: 12,
            ..BackoffConfig::default()
        };

        try_with_exponential_backoff(&config, &sleeper, &CancellationToken::new(), |_, _| async { false }).await;

        let delays = sleeper.delays.lock();
        assert_eq!(delays.len(), 11);
        assert!(delays.iter().all(|d| *d <= ms(5000)));
        assert_eq!(*delays.last().unwrap(), ms(5000));
    }

    #[tokio::test]
    async fn test_base_delay_above_max_is_clamped() {
        let sleeper = RecordingSleeper::default();
        let config = BackoffConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 100,
            max_retries: 3,
            ..BackoffConfig::default()
        };

        try_with_exponential_backoff(&config, &sleeper, &CancellationToken::new(), |_, _| async { false }).await;
        assert_eq!(*sleeper.delays.lock(), vec![ms(100), ms(100)]);
    }

    #[tokio::test]
    async fn test_fixed_interval_repeats_same_delay() {
        let sleeper = RecordingSleeper::default();
        let config = BackoffConfig::fixed(ms(500));
        let calls = AtomicU32::new(0);

        let result = try_with_exponential_backoff(&config, &sleeper, &CancellationToken::new(), |_, _| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n == 4 }
        })
        .await;

        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(*sleeper.delays.lock(), vec![ms(500); 4]);
    }

    #[tokio::test]
    async fn test_cancelled_sleeper_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sleeper = TokioSleeper::new(cancel);
        let calls = AtomicU32::new(0);

        let result = try_with_exponential_backoff(&BackoffConfig::fixed(ms(500)), &sleeper, &CancellationToken::new(), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;

        assert!(!result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_sleeper_waits_full_delay() {
        let sleeper = TokioSleeper::default();
        let started = tokio::time::Instant::now();

        assert!(sleeper.sleep(ms(1500)).await);
        assert!(started.elapsed() >= ms(1500));
    }

    #[tokio::test]
    async fn test_cancel_stops_unbounded_retry_with_any_sleeper() {
        let sleeper = RecordingSleeper::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = try_with_exponential_backoff(&BackoffConfig::fixed(ms(500)), &sleeper, &cancel, |_, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 9 {
                cancel.cancel();
            }
            async { false }
        })
        .await;

        assert!(!result);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_every_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result = try_with_exponential_backoff(
            &BackoffConfig::default(),
            &RecordingSleeper::default(),
            &cancel,
            |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { true }
            },
        )
        .await;

        assert!(!result);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
