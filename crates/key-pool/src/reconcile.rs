//! Reconciliation with the external mirror
//!
//! One tick:
//! 1. Read the mirror's dead markers (`{dead_prefix}{token}` keys)
//! 2. Sample one pool member that is not already marked dead
//! 3. Validate it; a `Dead` verdict joins the batch
//! 4. Evict the batch from the pool and delete its markers from the mirror
//! 5. Push the members admitted within `[now - TTL, now - 2 * acquire_interval]`
//!    to the snapshot key, or skip the push if that window is empty
//!
//! Every mirror call is best-effort: a failure is recorded in the report and
//! the remaining steps still run. Running the same tick twice against an
//! unchanged pool produces the same snapshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use upstream::{Mirror, Verdict};

use common::fingerprint;

use crate::error::{Error, Result};
use crate::manager::{EvictionReason, PoolManager};

/// Key names and encoding used in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorLayout {
    pub snapshot_key: String,
    pub dead_prefix: String,
    pub delimiter: String,
}

impl Default for MirrorLayout {
    fn default() -> Self {
        Self {
            snapshot_key: "openai_keys".into(),
            dead_prefix: "expired:".into(),
            delimiter: "\n".into(),
        }
    }
}

/// What happened to the snapshot push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    Pushed { members: usize },
    /// Nothing in the push window; the previous snapshot is left in place
    SkippedEmpty,
    Failed { detail: String },
}

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Dead markers found in the mirror
    pub known_dead: usize,
    /// Fingerprint of the sampled candidate
    pub candidate: Option<String>,
    pub candidate_verdict: Option<&'static str>,
    /// Tokens actually removed from the pool
    pub evicted: usize,
    pub push: PushOutcome,
    /// Steps that failed; the tick carried on past each of them
    pub failures: Vec<String>,
}

impl ReconcileReport {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Whether an operator should hear about this tick.
    pub fn needs_notice(&self) -> bool {
        self.is_degraded() || self.evicted > 0 || self.push == PushOutcome::SkippedEmpty
    }

    pub fn summary(&self) -> String {
        let push = match &self.push {
            PushOutcome::Pushed { members } => format!("pushed {members} key(s)"),
            PushOutcome::SkippedEmpty => "no keys in push window, snapshot left unchanged".into(),
            PushOutcome::Failed { detail } => format!("push failed: {detail}"),
        };
        let mut text = format!(
            "{} dead marker(s), {} evicted, {push}",
            self.known_dead, self.evicted
        );
        if !self.failures.is_empty() {
            text.push_str("; failures: ");
            text.push_str(&self.failures.join("; "));
        }
        text
    }

    /// `Err(PartialReconciliation)` when any step failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_degraded() {
            Err(Error::PartialReconciliation(self.summary()))
        } else {
            Ok(self)
        }
    }
}

pub struct Reconciler {
    manager: Arc<PoolManager>,
    mirror: Arc<dyn Mirror>,
    layout: MirrorLayout,
    /// Seconds; follows the acquire schedule's spacing
    acquire_interval: AtomicU64,
}

impl Reconciler {
    pub fn new(
        manager: Arc<PoolManager>,
        mirror: Arc<dyn Mirror>,
        layout: MirrorLayout,
        acquire_interval: Duration,
    ) -> Self {
        Self {
            manager,
            mirror,
            layout,
            acquire_interval: AtomicU64::new(acquire_interval.as_secs()),
        }
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    pub fn acquire_interval(&self) -> Duration {
        Duration::from_secs(self.acquire_interval.load(Ordering::Acquire))
    }

    /// Move the push window's young edge after the acquire job is rescheduled.
    pub fn set_acquire_interval(&self, interval: Duration) {
        let previous = self
            .acquire_interval
            .swap(interval.as_secs(), Ordering::AcqRel);
        if previous != interval.as_secs() {
            info!(
                previous_secs = previous,
                interval_secs = interval.as_secs(),
                "push window follows new acquire interval"
            );
        }
    }

    /// Run one reconciliation tick.
    pub async fn tick(&self) -> ReconcileReport {
        let mut failures = Vec::new();
        let prefix = self.layout.dead_prefix.as_str();

        let known_dead: HashSet<String> = match self.mirror.list_keys(prefix).await {
            Ok(keys) => keys
                .iter()
                .filter_map(|key| key.strip_prefix(prefix))
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!(mirror = self.mirror.id(), error = %e, "listing dead markers failed");
                failures.push(format!("listing dead markers: {e}"));
                HashSet::new()
            }
        };

        let mut batch: Vec<String> = known_dead.iter().cloned().collect();
        batch.sort();

        let candidate = self.manager.pick_for_validation(&known_dead).await;
        let mut candidate_verdict = None;
        if let Some(token) = &candidate {
            let verdict = self.manager.validate(token).await;
            candidate_verdict = Some(verdict.label());
            match verdict {
                Verdict::Live => {}
                Verdict::Dead => {
                    info!(token = %fingerprint(token), "sampled token is dead");
                    batch.push(token.clone());
                }
                Verdict::TransportError(detail) => {
                    warn!(
                        token = %fingerprint(token),
                        error = %detail,
                        "candidate validation inconclusive"
                    );
                    failures.push(format!("validating candidate: {detail}"));
                }
            }
        }

        let mut evicted = 0;
        if !batch.is_empty() {
            match self
                .manager
                .evict(&batch, EvictionReason::Reconciliation)
                .await
            {
                Ok(n) => evicted = n,
                Err(e) => {
                    warn!(error = %e, "evicting dead batch failed");
                    failures.push(format!("evicting batch: {e}"));
                }
            }

            let markers: Vec<String> = batch.iter().map(|t| format!("{prefix}{t}")).collect();
            if let Err(e) = self.mirror.bulk_delete(&markers).await {
                warn!(mirror = self.mirror.id(), error = %e, "deleting dead markers failed");
                failures.push(format!("deleting dead markers: {e}"));
            }
        }

        let push = self.push_snapshot(&mut failures).await;

        let report = ReconcileReport {
            known_dead: known_dead.len(),
            candidate: candidate.as_deref().map(fingerprint),
            candidate_verdict,
            evicted,
            push,
            failures,
        };
        info!(
            known_dead = report.known_dead,
            evicted = report.evicted,
            degraded = report.is_degraded(),
            "reconciliation tick finished"
        );
        report
    }

    /// Members old enough to have settled, still within the TTL.
    pub async fn push_window(&self) -> Vec<String> {
        let now = self.manager.now_secs();
        let start = now.saturating_sub(self.manager.ttl().as_secs());
        let end = now.saturating_sub(2 * self.acquire_interval().as_secs());
        self.manager.list_in_window(Some(start), Some(end)).await
    }

    async fn push_snapshot(&self, failures: &mut Vec<String>) -> PushOutcome {
        let members = self.push_window().await;
        if members.is_empty() {
            warn!(
                key = %self.layout.snapshot_key,
                "no keys in push window, skipping snapshot"
            );
            return PushOutcome::SkippedEmpty;
        }

        let value = members.join(&self.layout.delimiter);
        match self.mirror.put(&self.layout.snapshot_key, &value).await {
            Ok(()) => {
                info!(key = %self.layout.snapshot_key, members = members.len(), "snapshot pushed");
                PushOutcome::Pushed {
                    members: members.len(),
                }
            }
            Err(e) => {
                warn!(mirror = self.mirror.id(), error = %e, "snapshot push failed");
                failures.push(format!("pushing snapshot: {e}"));
                PushOutcome::Failed {
                    detail: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::PoolStore;
    use upstream::{MemoryMirror, StaticValidator};

    const START: u64 = 1_700_000_000;
    const TTL: u64 = 241_920;
    const INTERVAL: u64 = 3_600;

    struct Fixture {
        manager: Arc<PoolManager>,
        validator: Arc<StaticValidator>,
        mirror: Arc<MemoryMirror>,
        clock: Arc<ManualClock>,
        reconciler: Reconciler,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let store = PoolStore::load(
            dir.path().join("pool.json"),
            Duration::from_secs(TTL),
            clock.clone(),
        )
        .await
        .unwrap();
        let validator = Arc::new(StaticValidator::all_live());
        let manager = Arc::new(PoolManager::new(store, validator.clone()));
        let mirror = Arc::new(MemoryMirror::new());
        let reconciler = Reconciler::new(
            manager.clone(),
            mirror.clone(),
            MirrorLayout::default(),
            Duration::from_secs(INTERVAL),
        );
        Fixture {
            manager,
            validator,
            mirror,
            clock,
            reconciler,
            _dir: dir,
        }
    }

    /// Old enough to fall inside the push window.
    fn settled() -> Duration {
        Duration::from_secs(3 * INTERVAL)
    }

    #[tokio::test]
    async fn pushes_settled_members_in_score_order() {
        let f = fixture().await;
        f.manager
            .admit("sk-b", Duration::from_secs(4 * INTERVAL))
            .await
            .unwrap();
        f.manager.admit("sk-a", settled()).await.unwrap();
        // Too young for the push window
        f.manager.admit("sk-new", Duration::ZERO).await.unwrap();

        let report = f.reconciler.tick().await;
        assert_eq!(report.push, PushOutcome::Pushed { members: 2 });
        assert!(!report.is_degraded());
        assert_eq!(
            f.mirror.get("openai_keys").await.as_deref(),
            Some("sk-b\nsk-a")
        );
    }

    #[tokio::test]
    async fn marked_dead_tokens_are_evicted_and_markers_cleared() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        f.manager.admit("sk-2", settled()).await.unwrap();
        f.mirror.insert("expired:sk-1", "").await;

        let report = f.reconciler.tick().await;
        assert_eq!(report.known_dead, 1);
        assert_eq!(report.evicted, 1);
        assert!(!f.manager.exists("sk-1").await);
        assert!(f.manager.exists("sk-2").await);
        assert_eq!(f.mirror.get("expired:sk-1").await, None);
        assert_eq!(f.mirror.get("openai_keys").await.as_deref(), Some("sk-2"));
    }

    #[tokio::test]
    async fn sampled_dead_token_leaves_snapshot() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        f.validator.set("sk-1", Verdict::Dead).await;

        let first = f.reconciler.tick().await;
        assert_eq!(first.candidate_verdict, Some("dead"));
        assert_eq!(first.evicted, 1);
        assert_eq!(first.push, PushOutcome::SkippedEmpty);
        assert!(first.needs_notice());

        f.manager.admit("sk-2", settled()).await.unwrap();
        let second = f.reconciler.tick().await;
        assert_eq!(second.push, PushOutcome::Pushed { members: 1 });
        let snapshot = f.mirror.get("openai_keys").await.unwrap();
        assert!(!snapshot.contains("sk-1"));
        assert_eq!(snapshot, "sk-2");
    }

    #[tokio::test]
    async fn transport_error_on_candidate_keeps_it() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        f.validator
            .set("sk-1", Verdict::TransportError("timeout".into()))
            .await;

        let report = f.reconciler.tick().await;
        assert_eq!(report.evicted, 0);
        assert!(report.is_degraded());
        assert!(f.manager.exists("sk-1").await);
        // Push still ran
        assert_eq!(f.mirror.get("openai_keys").await.as_deref(), Some("sk-1"));
        assert!(matches!(
            report.into_result(),
            Err(Error::PartialReconciliation(_))
        ));
    }

    #[tokio::test]
    async fn repeated_ticks_produce_same_snapshot() {
        let f = fixture().await;
        for i in 0..5 {
            f.manager
                .admit(&format!("sk-{i}"), Duration::from_secs(3 * INTERVAL + i))
                .await
                .unwrap();
        }

        f.reconciler.tick().await;
        let first = f.mirror.get("openai_keys").await.unwrap();
        f.reconciler.tick().await;
        let second = f.mirror.get("openai_keys").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, "sk-4\nsk-3\nsk-2\nsk-1\nsk-0");
    }

    #[tokio::test]
    async fn empty_window_skips_push_and_keeps_previous_snapshot() {
        let f = fixture().await;
        f.mirror.insert("openai_keys", "previous").await;
        f.manager.admit("sk-new", Duration::ZERO).await.unwrap();

        let report = f.reconciler.tick().await;
        assert_eq!(report.push, PushOutcome::SkippedEmpty);
        assert!(!report.is_degraded());
        assert_eq!(
            f.mirror.get("openai_keys").await.as_deref(),
            Some("previous")
        );
    }

    #[tokio::test]
    async fn list_failure_does_not_stop_push() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        f.mirror.set_fail_list(true);

        let report = f.reconciler.tick().await;
        assert_eq!(report.known_dead, 0);
        assert_eq!(report.push, PushOutcome::Pushed { members: 1 });
        assert_eq!(report.failures.len(), 1);
        assert!(report.summary().contains("listing dead markers"));
    }

    #[tokio::test]
    async fn push_failure_is_reported_not_fatal() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        f.mirror.insert("expired:sk-gone", "").await;
        f.mirror.set_fail_put(true);

        let report = f.reconciler.tick().await;
        assert!(matches!(report.push, PushOutcome::Failed { .. }));
        // Marker deletion ran before the failed push
        assert_eq!(f.mirror.get("expired:sk-gone").await, None);
        assert!(report.is_degraded());
    }

    #[tokio::test]
    async fn delete_failure_still_evicts_locally() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        f.mirror.insert("expired:sk-1", "").await;
        f.mirror.set_fail_delete(true);

        let report = f.reconciler.tick().await;
        assert_eq!(report.evicted, 1);
        assert!(!f.manager.exists("sk-1").await);
        assert!(report.failures.iter().any(|f| f.contains("deleting dead markers")));
    }

    #[tokio::test]
    async fn members_past_ttl_are_not_pushed() {
        let f = fixture().await;
        f.manager
            .admit("sk-old", Duration::from_secs(TTL - 1))
            .await
            .unwrap();
        f.manager.admit("sk-ok", settled()).await.unwrap();
        assert_eq!(f.reconciler.push_window().await, vec!["sk-old", "sk-ok"]);

        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.reconciler.push_window().await, vec!["sk-ok"]);
    }

    #[tokio::test]
    async fn push_window_follows_acquire_interval_changes() {
        let f = fixture().await;
        f.manager.admit("sk-1", settled()).await.unwrap();
        assert_eq!(f.reconciler.push_window().await, vec!["sk-1"]);

        f.reconciler
            .set_acquire_interval(Duration::from_secs(2 * INTERVAL));
        assert_eq!(
            f.reconciler.acquire_interval(),
            Duration::from_secs(2 * INTERVAL)
        );
        assert!(f.reconciler.push_window().await.is_empty());
        assert_eq!(f.reconciler.tick().await.push, PushOutcome::SkippedEmpty);

        f.reconciler.set_acquire_interval(Duration::from_secs(INTERVAL));
        assert_eq!(f.reconciler.push_window().await, vec!["sk-1"]);
    }
}
