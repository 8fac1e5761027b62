//! Built-in scheduled jobs

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;
use upstream::CredentialSource;

use common::fingerprint;

use crate::error::{Error, Result};
use crate::manager::PoolManager;
use crate::reconcile::Reconciler;
use crate::scheduler::Job;

pub const VALIDATE_JOB: &str = "validate";
pub const ACQUIRE_JOB: &str = "acquire";
pub const RECONCILE_JOB: &str = "reconcile";

/// Validate one random member, evicting it if dead.
pub struct ValidateJob {
    manager: Arc<PoolManager>,
}

impl ValidateJob {
    pub fn new(manager: Arc<PoolManager>) -> Self {
        Self { manager }
    }
}

impl Job for ValidateJob {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            let Some(token) = self.manager.pick_for_validation(&HashSet::new()).await else {
                info!("pool empty, nothing to validate");
                return Ok(Some("Pool is empty, no key to validate.".into()));
            };
            let fp = fingerprint(&token);
            if self.manager.evict_if_dead(&token).await? {
                Ok(Some(format!("Key {fp} is no longer valid and was removed.")))
            } else {
                Ok(None)
            }
        })
    }
}

/// Pull a batch from the credential source and admit it.
pub struct AcquireJob {
    manager: Arc<PoolManager>,
    source: Arc<dyn CredentialSource>,
    batch: usize,
}

impl AcquireJob {
    pub fn new(manager: Arc<PoolManager>, source: Arc<dyn CredentialSource>, batch: usize) -> Self {
        Self {
            manager,
            source,
            batch,
        }
    }
}

impl Job for AcquireJob {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            let tokens = self
                .source
                .acquire(self.batch)
                .await
                .map_err(|e| Error::Acquisition(format!("{}: {e}", self.source.id())))?;
            let received = tokens.len();
            if received == 0 {
                info!(source = self.source.id(), "source had nothing new");
                return Ok(None);
            }

            let admitted = self.manager.admit_new(tokens).await?;
            info!(source = self.source.id(), received, admitted, "acquisition finished");
            Ok((admitted > 0).then(|| format!("Admitted {admitted} of {received} new key(s).")))
        })
    }
}

/// One reconciliation tick; partial failures fail the run.
pub struct ReconcileJob {
    reconciler: Arc<Reconciler>,
}

impl ReconcileJob {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

impl Job for ReconcileJob {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            let report = self.reconciler.tick().await;
            let notice = report.needs_notice();
            let report = report.into_result()?;
            Ok(notice.then(|| report.summary()))
        })
    }
}
