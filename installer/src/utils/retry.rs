//! Reusable retry policy for readiness polling.
//!
//! One `RetryPolicy` is built per call site (per service health check, per smoke check, per
//! secrets-engine status poll) instead of ad-hoc attempt counters. Delays are a fixed interval
//! from `tokio-retry`, optionally jittered.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, FixedInterval};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    #[serde(default)]
    pub jitter: bool,
    /// Log a progress line every N attempts so long waits stay observable.
    #[serde(default = "default_progress_every")]
    pub progress_every: u32,
}

fn default_progress_every() -> u32 {
    5
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            jitter: false,
            progress_every: default_progress_every(),
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Upper bound of the time spent sleeping between attempts (jitter only shortens delays).
    pub fn budget(&self) -> Duration {
        self.interval
            .saturating_mul(self.max_attempts.saturating_sub(1))
    }

    /// Delays to sleep between consecutive attempts (`max_attempts - 1` items).
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let millis = self.interval.as_millis().min(u64::MAX as u128) as u64;
        let base = FixedInterval::from_millis(millis).take(self.max_attempts.saturating_sub(1) as usize);
        if self.jitter {
            Box::new(base.map(jitter))
        } else {
            Box::new(base)
        }
    }

    pub fn should_log_progress(&self, attempt: u32) -> bool {
        self.progress_every > 0 && attempt % self.progress_every == 0
    }

    /// Run `op` until it succeeds or the attempt budget is spent. Returns the last error.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        tokio_retry::Retry::spawn(self.delays(), op).await
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_count_is_attempts_minus_one() {
        let p = RetryPolicy::new(4, Duration::from_millis(10));
        let delays: Vec<Duration> = p.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(10); 3]);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let p = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.delays().count(), 0);
        assert_eq!(p.budget(), Duration::ZERO);
    }

    #[test]
    fn jittered_delays_never_exceed_interval() {
        let p = RetryPolicy::new(20, Duration::from_millis(50)).with_jitter();
        assert!(p.delays().all(|d| d <= Duration::from_millis(50)));
    }

    #[test]
    fn policy_deserializes_interval_in_millis() {
        let p: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 30, "interval": 2000}"#).unwrap();
        assert_eq!(p.interval, Duration::from_secs(2));
        assert_eq!(p.progress_every, 5);
        assert!(!p.jitter);
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(5, Duration::from_millis(1));
        let out: Result<u32, String> = p
            .retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("attempt {}", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_error_when_budget_spent() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::new(3, Duration::from_millis(1));
        let out: Result<(), String> = p
            .retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(format!("attempt {}", n)) }
            })
            .await;
        assert_eq!(out, Err("attempt 3".to_string()));
    }
}
