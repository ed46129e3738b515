//! Named throttle scopes sharing one history store.
//!
//! A request pipeline usually applies several throttles at once (say, a
//! per-user sustained rate and a per-address burst rate). `ThrottleSet` keeps
//! one limiter per scope and combines their decisions.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use super::key::ThrottleKey;
use super::limiter::{Decision, RateLimiter, DEFAULT_MAX_RETRIES};
use crate::error::{Result, ThrottleError};
use crate::store::HistoryStore;

/// Scope name to optional rate (`None` = unlimited), as found in configuration.
pub type ScopeRates = HashMap<String, Option<String>>;

/// A table of per-scope limiters.
pub struct ThrottleSet {
    store: Arc<dyn HistoryStore>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    max_retries: usize,
}

impl ThrottleSet {
    /// Create an empty set over `store`.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            limiters: RwLock::new(HashMap::new()),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Create a set with one limiter per configured scope.
    pub fn from_rates(rates: &ScopeRates, store: Arc<dyn HistoryStore>) -> Result<Self> {
        let set = Self::new(store);
        set.set_rates(rates)?;
        Ok(set)
    }

    /// Bound compare-and-set attempts for limiters built from now on.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replace every scope at once.
    ///
    /// All rates are validated first; on error the current table is kept.
    pub fn set_rates(&self, rates: &ScopeRates) -> Result<()> {
        let mut limiters = HashMap::with_capacity(rates.len());
        for (scope, rate) in rates {
            limiters.insert(scope.clone(), Arc::new(self.build(scope, rate.as_deref())?));
        }

        info!(scopes = limiters.len(), "Loaded throttle scopes");
        *self.limiters.write() = limiters;
        Ok(())
    }

    /// Add or replace a single scope.
    pub fn set_scope(&self, scope: &str, rate: Option<&str>) -> Result<()> {
        let limiter = Arc::new(self.build(scope, rate)?);
        self.limiters.write().insert(scope.to_string(), limiter);
        Ok(())
    }

    fn build(&self, scope: &str, rate: Option<&str>) -> Result<RateLimiter> {
        if scope.is_empty() {
            return Err(ThrottleError::InvalidConfiguration(
                "scope name must not be empty".to_string(),
            ));
        }
        let limiter = RateLimiter::from_rate(rate, self.store.clone()).map_err(|e| match e {
            ThrottleError::InvalidConfiguration(reason) => {
                ThrottleError::InvalidConfiguration(format!("scope '{}': {}", scope, reason))
            }
            other => other,
        })?;
        debug!(scope, rate = ?rate, "Configured throttle scope");
        Ok(limiter.with_max_retries(self.max_retries))
    }

    /// Names of all configured scopes, sorted.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.limiters.read().keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// The limiter for `scope`.
    pub fn limiter(&self, scope: &str) -> Result<Arc<RateLimiter>> {
        self.limiters.read().get(scope).cloned().ok_or_else(|| {
            ThrottleError::InvalidConfiguration(format!("no rate set for scope '{}'", scope))
        })
    }

    /// Check one subject against one scope.
    pub async fn check(&self, scope: &str, ident: &str, now: f64) -> Result<Decision> {
        let limiter = self.limiter(scope)?;
        let key = ThrottleKey::new(scope, ident);
        limiter.check(&key.to_cache_key(), now).await
    }

    /// Check every `(scope, ident)` pair and combine the results.
    ///
    /// All throttles are evaluated, even after one denies, so each admitting
    /// scope still records the request. The combined decision is a denial
    /// with the longest wait if any scope denied.
    ///
    /// Unknown scopes are rejected before anything is recorded. A backend
    /// error is different: scopes are checked concurrently, and an admission
    /// another scope already recorded is not rolled back when one of them
    /// fails. The caller only sees the error.
    #[instrument(skip(self, requests), fields(throttles = requests.len()))]
    pub async fn check_all(&self, requests: &[(&str, &str)], now: f64) -> Result<Decision> {
        // Resolve every scope before recording anything
        let checks = requests
            .iter()
            .map(|(scope, ident)| -> Result<_> {
                Ok((self.limiter(scope)?, ThrottleKey::new(scope, ident)))
            })
            .collect::<Result<Vec<_>>>()?;

        let decisions = try_join_all(
            checks
                .iter()
                .map(|(limiter, key)| async move { limiter.check(&key.to_cache_key(), now).await }),
        )
        .await?;

        Ok(combine(&decisions))
    }
}

/// Admit only if everything admitted; otherwise deny with the longest wait.
pub fn combine(decisions: &[Decision]) -> Decision {
    decisions
        .iter()
        .filter_map(Decision::wait)
        .max()
        .map_or(Decision::Admit, |wait| Decision::Deny { wait })
}
