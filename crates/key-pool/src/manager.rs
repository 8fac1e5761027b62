//! Pool manager
//!
//! Wraps the store with the validator and owns the policy decisions: which
//! verdicts evict, how fresh batches are admitted, how a validation target is
//! sampled. Every scheduled job and admin route goes through here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use upstream::{Validator, Verdict};

use common::fingerprint;

use crate::error::{Error, Result};
use crate::store::{Admission, PoolStore};

/// Random draws before `pick_for_validation` gives up.
pub const SAMPLE_ATTEMPTS: usize = 20;

/// Why tokens left the pool, for the evictions counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Operator,
    Validation,
    Reconciliation,
}

impl EvictionReason {
    pub fn label(&self) -> &'static str {
        match self {
            EvictionReason::Operator => "operator",
            EvictionReason::Validation => "validation",
            EvictionReason::Reconciliation => "reconciliation",
        }
    }
}

pub struct PoolManager {
    store: PoolStore,
    validator: Arc<dyn Validator>,
}

impl PoolManager {
    pub fn new(store: PoolStore, validator: Arc<dyn Validator>) -> Self {
        info!(validator = validator.id(), "pool manager initialized");
        Self { store, validator }
    }

    /// Admit a freshly acquired batch at age zero.
    ///
    /// Duplicates within the batch, tokens that are already current and
    /// malformed tokens are skipped. Returns how many were admitted.
    pub async fn admit_new<I>(&self, tokens: I) -> Result<usize>
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let mut admitted = 0usize;
        for raw in tokens {
            let token = raw.trim().to_string();
            if token.is_empty() || !seen.insert(token.clone()) {
                continue;
            }
            if self.store.exists(&token).await {
                debug!(token = %fingerprint(&token), "already in pool, skipping");
                continue;
            }
            match self.admit(&token, Duration::ZERO).await {
                Ok(Admission::Inserted | Admission::Refreshed) => admitted += 1,
                Ok(Admission::TooStale) => {}
                Err(Error::InvalidToken(reason)) => {
                    warn!(token = %fingerprint(&token), reason = %reason, "skipping malformed token");
                }
                Err(e) => return Err(e),
            }
        }
        self.record_size().await;
        Ok(admitted)
    }

    /// Admit one token observed to be `observed_age` old.
    pub async fn admit(&self, token: &str, observed_age: Duration) -> Result<Admission> {
        let admission = self.store.admit(token, observed_age).await?;
        metrics::counter!("keypool_admissions_total", "outcome" => admission.label()).increment(1);
        if admission == Admission::TooStale {
            info!(
                token = %fingerprint(token.trim()),
                observed_age_secs = observed_age.as_secs(),
                "token rejected, older than TTL"
            );
        }
        Ok(admission)
    }

    /// Remove tokens. Returns how many were present.
    pub async fn evict(&self, tokens: &[String], reason: EvictionReason) -> Result<usize> {
        let removed = self.store.evict(tokens).await?;
        if removed > 0 {
            metrics::counter!("keypool_evictions_total", "reason" => reason.label())
                .increment(removed as u64);
            info!(
                requested = tokens.len(),
                removed,
                reason = reason.label(),
                "evicted tokens"
            );
            self.record_size().await;
        }
        Ok(removed)
    }

    /// Validate `token` and evict it if the upstream says it is dead.
    ///
    /// `Live` → `false`. `Dead` → evicted, `true`. A transport failure leaves
    /// the pool untouched and surfaces as `Error::Transport`.
    pub async fn evict_if_dead(&self, token: &str) -> Result<bool> {
        let fp = fingerprint(token);
        match self.validate(token).await {
            Verdict::Live => {
                debug!(token = %fp, "token still live");
                Ok(false)
            }
            Verdict::Dead => {
                self.evict(&[token.to_string()], EvictionReason::Validation)
                    .await?;
                info!(token = %fp, "token dead, evicted");
                Ok(true)
            }
            Verdict::TransportError(detail) => {
                warn!(token = %fp, error = %detail, "validation inconclusive, keeping token");
                Err(Error::Transport(detail))
            }
        }
    }

    /// Ask the validator about `token`.
    pub async fn validate(&self, token: &str) -> Verdict {
        let verdict = self.validator.validate(token).await;
        metrics::counter!("keypool_validations_total", "verdict" => verdict.label()).increment(1);
        verdict
    }

    /// Random member not in `exclude`.
    ///
    /// Gives up after `SAMPLE_ATTEMPTS` draws, so a pool made mostly of
    /// excluded tokens can return `None` even when an eligible one exists.
    pub async fn pick_for_validation(&self, exclude: &HashSet<String>) -> Option<String> {
        for _ in 0..SAMPLE_ATTEMPTS {
            let token = self.store.sample_one().await?;
            if !exclude.contains(&token) {
                return Some(token);
            }
        }
        debug!(
            excluded = exclude.len(),
            attempts = SAMPLE_ATTEMPTS,
            "no eligible token for validation"
        );
        None
    }

    /// Random member.
    pub async fn sample(&self) -> Option<String> {
        self.store.sample_one().await
    }

    /// Members admitted within `[start, end]`, oldest first.
    pub async fn list_in_window(&self, start: Option<u64>, end: Option<u64>) -> Vec<String> {
        self.store.list_in_window(start, end).await
    }

    /// Members admitted within the last TTL.
    pub async fn list_current(&self) -> Vec<String> {
        self.store.list_in_window(None, None).await
    }

    /// How long ago `token` was admitted.
    pub async fn age_of(&self, token: &str) -> Option<Duration> {
        let admitted_at = self.store.admitted_at(token).await?;
        Some(Duration::from_secs(
            self.store.now_secs().saturating_sub(admitted_at),
        ))
    }

    pub async fn exists(&self, token: &str) -> bool {
        self.store.exists(token).await
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty().await
    }

    pub fn ttl(&self) -> Duration {
        self.store.ttl()
    }

    pub fn now_secs(&self) -> u64 {
        self.store.now_secs()
    }

    /// Pool summary for the health endpoint.
    ///
    /// `healthy` with at least one current member, `empty` otherwise.
    pub async fn health(&self) -> serde_json::Value {
        let total = self.store.len().await;
        let current = self.store.current_len().await;
        let status = if current > 0 { "healthy" } else { "empty" };
        serde_json::json!({
            "status": status,
            "members_total": total,
            "members_current": current,
            "ttl_secs": self.ttl().as_secs(),
        })
    }

    async fn record_size(&self) {
        metrics::gauge!("keypool_members").set(self.store.len().await as f64);
    }
}
