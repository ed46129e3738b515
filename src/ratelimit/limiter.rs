//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::history::HistoryRecord;
use super::policy::RatePolicy;
use crate::error::{Result, ThrottleError};
use crate::store::HistoryStore;

/// Default number of compare-and-set attempts before giving up on a key.
pub const DEFAULT_MAX_RETRIES: usize = 64;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request may proceed; it has been recorded against the key.
    Admit,
    /// The request must be rejected; a slot frees up after `wait`.
    Deny { wait: Duration },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    /// Remaining wait for a denied request.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Decision::Admit => None,
            Decision::Deny { wait } => Some(*wait),
        }
    }

    /// Wait rounded up to whole seconds, suitable for a retry-after hint.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.wait().map(|wait| wait.as_secs_f64().ceil() as u64)
    }
}

/// A sliding-window rate limiter over a shared history store.
///
/// Each check reads the key's history, drops expired admissions, and either
/// denies (leaving the history untouched) or records the new admission with
/// a compare-and-set, retrying if another writer changed the key meanwhile.
/// Keys never affect each other.
pub struct RateLimiter {
    /// `None` means unlimited
    policy: Option<RatePolicy>,
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    max_retries: usize,
}

impl RateLimiter {
    /// Create a limiter enforcing `policy`.
    pub fn new(policy: RatePolicy, store: Arc<dyn HistoryStore>) -> Self {
        Self::build(Some(policy), store)
    }

    /// Create a limiter that admits everything and records nothing.
    pub fn unlimited(store: Arc<dyn HistoryStore>) -> Self {
        Self::build(None, store)
    }

    /// Create a limiter from an optional `"<quota>/<period>"` rate.
    pub fn from_rate(rate: Option<&str>, store: Arc<dyn HistoryStore>) -> Result<Self> {
        let policy = rate.map(str::parse::<RatePolicy>).transpose()?;
        Ok(Self::build(policy, store))
    }

    fn build(policy: Option<RatePolicy>, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            policy,
            store,
            clock: Arc::new(SystemClock),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Use `clock` for [`RateLimiter::check_now`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound the number of compare-and-set attempts per check.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// The active policy, or `None` when unlimited.
    pub fn policy(&self) -> Option<&RatePolicy> {
        self.policy.as_ref()
    }

    /// Check whether a request for `key` at `now` (seconds) may proceed.
    pub async fn check(&self, key: &str, now: f64) -> Result<Decision> {
        if key.is_empty() {
            return Err(ThrottleError::InvalidArgument(
                "identity key must not be empty".to_string(),
            ));
        }
        if !now.is_finite() {
            return Err(ThrottleError::InvalidArgument(format!(
                "timestamp must be finite, got {}",
                now
            )));
        }

        let Some(policy) = self.policy else {
            return Ok(Decision::Admit);
        };
        let quota = policy.quota() as usize;
        let window = policy.window_secs();

        trace!(key, now, policy = %policy, "Checking rate limit");

        for attempt in 1..=self.max_retries {
            let current = self.store.get(key).await?;

            let mut history = current.clone().unwrap_or_default();
            history.prune(now, window);

            if history.len() >= quota {
                let wait = history.wait_time(now, window);
                debug!(
                    key,
                    recorded = history.len(),
                    quota,
                    wait_secs = wait.as_secs_f64(),
                    "Rate limit exceeded"
                );
                return Ok(Decision::Deny { wait });
            }

            history.record(now);
            if self
                .store
                .compare_and_set(key, current.as_ref(), history, policy.window())
                .await?
            {
                return Ok(Decision::Admit);
            }

            trace!(key, attempt, "History changed concurrently, retrying");
        }

        warn!(key, attempts = self.max_retries, "Giving up after repeated write conflicts");
        Err(ThrottleError::Contention {
            key: key.to_string(),
            attempts: self.max_retries,
        })
    }

    /// Check `key` at the limiter's clock time.
    pub async fn check_now(&self, key: &str) -> Result<Decision> {
        self.check(key, self.clock.now()).await
    }

    /// The stored history for `key`, without pruning.
    pub async fn history(&self, key: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.store.get(key).await?)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
