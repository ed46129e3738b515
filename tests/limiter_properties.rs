//! Behavioural properties of the sliding-window limiter, exercised through
//! the public API against the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Barrier;

use sliding_throttle::ratelimit::{Decision, HistoryRecord, RateLimiter, RatePolicy};
use sliding_throttle::store::{HistoryStore, MemoryStore, StoreError};
use sliding_throttle::ThrottleError;

fn policy(quota: u32, window_secs: f64) -> RatePolicy {
    RatePolicy::from_secs_f64(quota, window_secs).unwrap()
}

fn limiter_with_store(quota: u32, window_secs: f64) -> (RateLimiter, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (RateLimiter::new(policy(quota, window_secs), store.clone()), store)
}

async fn entries(limiter: &RateLimiter, key: &str) -> Vec<f64> {
    limiter
        .history(key)
        .await
        .unwrap()
        .map(|record| record.iter().collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_fresh_key_is_admitted() {
    let (limiter, _) = limiter_with_store(1, 60.0);
    for key in ["alice", "bob", "10.0.0.1", "throttle_user_7"] {
        assert_eq!(limiter.check(key, 1_000.0).await.unwrap(), Decision::Admit);
    }
}

#[tokio::test]
async fn test_unlimited_always_admits() {
    let store = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::unlimited(store.clone());

    for i in 0..10_000 {
        let key = format!("key-{}", i % 7);
        assert!(limiter.check(&key, i as f64 * 0.0001).await.unwrap().is_admitted());
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_expiry_resets_history() {
    let (limiter, _) = limiter_with_store(3, 10.0);
    for t in [0.0, 1.0, 2.0] {
        assert!(limiter.check("user", t).await.unwrap().is_admitted());
    }
    assert_eq!(entries(&limiter, "user").await, vec![2.0, 1.0, 0.0]);

    assert!(limiter.check("user", 13.0).await.unwrap().is_admitted());
    assert_eq!(entries(&limiter, "user").await, vec![13.0]);
}

#[tokio::test]
async fn test_wait_decreases_until_slot_frees() {
    let (limiter, _) = limiter_with_store(3, 10.0);
    for t in [0.0, 1.0, 2.0] {
        assert!(limiter.check("user", t).await.unwrap().is_admitted());
    }

    let mut previous = Duration::MAX;
    for t in [5.0, 6.0, 7.5, 9.0, 9.9] {
        let wait = limiter.check("user", t).await.unwrap().wait().unwrap();
        assert!(wait < previous, "wait must shrink as time advances");
        previous = wait;
    }

    let decision = limiter.check("user", 5.0).await.unwrap();
    assert_eq!(decision.wait(), Some(Duration::from_secs(5)));
    let decision = limiter.check("user", 9.0).await.unwrap();
    assert_eq!(decision.wait(), Some(Duration::from_secs(1)));

    // t=0 is exactly one window old at t=10 and no longer counts
    assert!(limiter.check("user", 10.0).await.unwrap().is_admitted());
    assert_eq!(entries(&limiter, "user").await, vec![10.0, 2.0, 1.0]);
}

#[tokio::test]
async fn test_keys_are_independent() {
    let (limiter, _) = limiter_with_store(2, 60.0);

    for t in 0..10 {
        limiter.check("a", t as f64).await.unwrap();
    }
    assert!(!limiter.check("a", 10.0).await.unwrap().is_admitted());

    assert!(limiter.check("b", 10.0).await.unwrap().is_admitted());
    assert_eq!(entries(&limiter, "b").await, vec![10.0]);
    assert_eq!(entries(&limiter, "a").await, vec![1.0, 0.0]);
}

#[tokio::test]
async fn test_denial_does_not_mutate_history() {
    let (limiter, _) = limiter_with_store(2, 30.0);
    limiter.check("user", 0.0).await.unwrap();
    limiter.check("user", 1.0).await.unwrap();
    let before = limiter.history("user").await.unwrap();

    for _ in 0..25 {
        let decision = limiter.check("user", 3.0).await.unwrap();
        assert_eq!(decision, Decision::Deny { wait: Duration::from_secs(27) });
    }

    assert_eq!(limiter.history("user").await.unwrap(), before);
}

#[tokio::test]
async fn test_out_of_order_timestamps_respect_quota() {
    let (limiter, _) = limiter_with_store(2, 10.0);

    // A slow worker reports t=4 after t=5 was already recorded
    assert!(limiter.check("user", 5.0).await.unwrap().is_admitted());
    assert!(limiter.check("user", 4.0).await.unwrap().is_admitted());
    assert_eq!(entries(&limiter, "user").await, vec![5.0, 4.0]);

    // Only 4.0 has expired, so one slot frees up
    assert!(limiter.check("user", 14.5).await.unwrap().is_admitted());
    assert_eq!(entries(&limiter, "user").await, vec![14.5, 5.0]);

    let decision = limiter.check("user", 14.6).await.unwrap();
    assert!(!decision.is_admitted());
    assert_eq!(entries(&limiter, "user").await, vec![14.5, 5.0]);
}

#[tokio::test]
async fn test_slow_caller_clock_keeps_history() {
    let (limiter, _) = limiter_with_store(1, 0.05);
    assert!(limiter.check("user", 0.0).await.unwrap().is_admitted());

    // Far more wall time passes than caller time
    tokio::time::sleep(Duration::from_millis(100)).await;

    let decision = limiter.check("user", 0.01).await.unwrap();
    assert!(!decision.is_admitted());
    assert_eq!(entries(&limiter, "user").await, vec![0.0]);
}

#[tokio::test]
async fn test_quota_invariant_over_random_traffic() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for (quota, window) in [(1, 1.0), (3, 10.0), (5, 2.5), (10, 60.0)] {
        let (limiter, _) = limiter_with_store(quota, window);
        let mut now = 0.0;
        let mut admitted = Vec::new();

        for _ in 0..2_000 {
            now += rng.gen_range(0.0..window / quota as f64 * 2.0);
            let decision = limiter.check("user", now).await.unwrap();
            match decision {
                Decision::Admit => admitted.push(now),
                Decision::Deny { wait } => {
                    assert!(wait <= Duration::from_secs_f64(window) + Duration::from_millis(1));
                }
            }
        }

        // No interval [t, t + window) may contain more than `quota` admissions
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t < start + window)
                .count();
            assert!(
                in_window <= quota as usize,
                "{} admissions within {}s of {} (quota {})",
                in_window,
                window,
                start,
                quota
            );
        }
        assert!(!admitted.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_admit_exactly_once() {
    let (limiter, _) = limiter_with_store(1, 60.0);
    let limiter = Arc::new(limiter);

    for round in 0..50 {
        let key = format!("fresh-{}", round);
        let barrier = Arc::new(Barrier::new(2));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    limiter.check(&key, 100.0).await.unwrap()
                })
            })
            .collect();

        let decisions = futures::future::join_all(tasks).await;
        let admitted = decisions
            .into_iter()
            .map(|d| d.unwrap())
            .filter(Decision::is_admitted)
            .count();
        assert_eq!(admitted, 1, "round {}", round);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_burst_respects_quota() {
    let (limiter, _) = limiter_with_store(5, 60.0);
    let limiter = Arc::new(limiter);
    let barrier = Arc::new(Barrier::new(32));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                limiter.check("shared", 1.0 + i as f64 * 1e-6).await.unwrap()
            })
        })
        .collect();

    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|d| d.as_ref().unwrap().is_admitted())
        .count();
    assert_eq!(admitted, 5);

    let shared = entries(&limiter, "shared").await;
    assert_eq!(shared.len(), 5);
    assert!(shared.windows(2).all(|pair| pair[0] >= pair[1]));
}

/// Lets a rival writer slip in just before the limiter's first write.
struct InterleavingStore {
    inner: MemoryStore,
    interfered: AtomicBool,
}

#[async_trait]
impl HistoryStore for InterleavingStore {
    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, record: HistoryRecord, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set(key, record, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&HistoryRecord>,
        record: HistoryRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if !self.interfered.swap(true, Ordering::SeqCst) {
            let rival: HistoryRecord = [record.newest().unwrap_or_default()].into_iter().collect();
            self.inner.set(key, rival, ttl).await?;
        }
        self.inner.compare_and_set(key, expected, record, ttl).await
    }
}

#[tokio::test]
async fn test_lost_race_is_rechecked() {
    let store = Arc::new(InterleavingStore {
        inner: MemoryStore::new(),
        interfered: AtomicBool::new(false),
    });
    let limiter = RateLimiter::new(policy(1, 60.0), store.clone());

    // The rival took the only slot, so the retry must deny
    let decision = limiter.check("user", 5.0).await.unwrap();
    assert_eq!(decision, Decision::Deny { wait: Duration::from_secs(60) });
    assert_eq!(entries(&limiter, "user").await, vec![5.0]);
}

/// A store that fails every call after `healthy_calls` successes.
struct FlakyStore {
    inner: MemoryStore,
    healthy_calls: usize,
    calls: AtomicUsize,
}

impl FlakyStore {
    fn new(healthy_calls: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            healthy_calls,
            calls: AtomicUsize::new(0),
        }
    }

    fn gate(&self) -> Result<(), StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.healthy_calls {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>, StoreError> {
        self.gate()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, record: HistoryRecord, ttl: Duration) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.set(key, record, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&HistoryRecord>,
        record: HistoryRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.gate()?;
        self.inner.compare_and_set(key, expected, record, ttl).await
    }
}

#[tokio::test]
async fn test_backend_failure_on_read_is_surfaced() {
    let limiter = RateLimiter::new(policy(3, 10.0), Arc::new(FlakyStore::new(0)));
    let err = limiter.check("user", 0.0).await.unwrap_err();
    assert!(matches!(err, ThrottleError::BackendUnavailable(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_backend_failure_on_write_is_surfaced() {
    // The read succeeds, the compare-and-set fails
    let limiter = RateLimiter::new(policy(3, 10.0), Arc::new(FlakyStore::new(1)));
    let err = limiter.check("user", 0.0).await.unwrap_err();
    assert!(matches!(err, ThrottleError::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_invalid_key_skips_backend() {
    let store = Arc::new(FlakyStore::new(0));
    let limiter = RateLimiter::new(policy(3, 10.0), store.clone());

    let err = limiter.check("", 0.0).await.unwrap_err();
    assert!(matches!(err, ThrottleError::InvalidArgument(_)));
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
}
