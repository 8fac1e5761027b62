//! In-process collaborators
//!
//! `MemoryMirror` keeps the mirror in a `BTreeMap` for single-node setups and
//! tests. It can be told to fail individual operations so the pool's
//! best-effort handling of mirror outages can be exercised without a network.
//! `StaticValidator` answers from a verdict table instead of calling out,
//! which is what dry runs and tests want.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{CredentialSource, Mirror, Notifier, Result, UpstreamError, Validator, Verdict};

/// Mirror backed by an in-memory ordered map.
#[derive(Default)]
pub struct MemoryMirror {
    entries: Mutex<BTreeMap<String, String>>,
    fail_put: AtomicBool,
    fail_list: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value back (mirror consumers, tests).
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Write a value directly, bypassing failure injection.
    pub async fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().await.insert(key.into(), value.into());
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make subsequent `put` calls fail with a transport error.
    pub fn set_fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent `list_keys` calls fail with a transport error.
    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent `bulk_delete` calls fail with a transport error.
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::Relaxed);
    }
}

impl Mirror for MemoryMirror {
    fn id(&self) -> &str {
        "memory"
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_put.load(Ordering::Relaxed) {
                return Err(UpstreamError::Transport("memory mirror put disabled".into()));
            }
            self.entries
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            debug!(key, bytes = value.len(), "memory mirror put");
            Ok(())
        })
    }

    fn list_keys<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_list.load(Ordering::Relaxed) {
                return Err(UpstreamError::Transport(
                    "memory mirror list disabled".into(),
                ));
            }
            let entries = self.entries.lock().await;
            Ok(entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    fn bulk_delete<'a>(
        &'a self,
        keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_delete.load(Ordering::Relaxed) {
                return Err(UpstreamError::Transport(
                    "memory mirror delete disabled".into(),
                ));
            }
            let mut entries = self.entries.lock().await;
            for key in keys {
                entries.remove(key);
            }
            debug!(count = keys.len(), "memory mirror bulk delete");
            Ok(())
        })
    }
}

/// Validator answering from a fixed table, `default` for unknown tokens.
pub struct StaticValidator {
    verdicts: Mutex<HashMap<String, Verdict>>,
    default: Verdict,
    calls: AtomicUsize,
}

impl StaticValidator {
    pub fn new(default: Verdict) -> Self {
        Self {
            verdicts: Mutex::new(HashMap::new()),
            default,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every token is live unless told otherwise.
    pub fn all_live() -> Self {
        Self::new(Verdict::Live)
    }

    pub async fn set(&self, token: impl Into<String>, verdict: Verdict) {
        self.verdicts.lock().await.insert(token.into(), verdict);
    }

    /// Number of `validate` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Validator for StaticValidator {
    fn id(&self) -> &str {
        "static"
    }

    fn validate<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Verdict> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.verdicts
                .lock()
                .await
                .get(token)
                .cloned()
                .unwrap_or_else(|| self.default.clone())
        })
    }
}

/// Source that never produces anything. Used when no acquisition is configured.
pub struct NoopSource;

impl CredentialSource for NoopSource {
    fn id(&self) -> &str {
        "noop"
    }

    fn acquire(
        &self,
        _max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Notifier that writes operator messages to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        title: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!(title, text, "operator notification");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_list_by_prefix() {
        let mirror = MemoryMirror::new();
        mirror.put("openai_keys", "sk-1\nsk-2").await.unwrap();
        mirror.put("expired:sk-3", "1").await.unwrap();
        mirror.put("expired:sk-4", "1").await.unwrap();

        let keys = mirror.list_keys("expired:").await.unwrap();
        assert_eq!(keys, vec!["expired:sk-3", "expired:sk-4"]);
        assert_eq!(mirror.get("openai_keys").await.as_deref(), Some("sk-1\nsk-2"));
    }

    #[tokio::test]
    async fn bulk_delete_ignores_missing_keys() {
        let mirror = MemoryMirror::new();
        mirror.insert("expired:a", "1").await;
        mirror
            .bulk_delete(&["expired:a".to_string(), "expired:missing".to_string()])
            .await
            .unwrap();
        assert!(mirror.is_empty().await);
    }

    #[tokio::test]
    async fn injected_failures_are_independent() {
        let mirror = MemoryMirror::new();
        mirror.set_fail_list(true);

        assert!(mirror.list_keys("").await.is_err());
        mirror.put("k", "v").await.unwrap();
        mirror.bulk_delete(&["k".to_string()]).await.unwrap();

        mirror.set_fail_list(false);
        assert!(mirror.list_keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_put_leaves_previous_value() {
        let mirror = MemoryMirror::new();
        mirror.put("openai_keys", "sk-1").await.unwrap();
        mirror.set_fail_put(true);

        let err = mirror.put("openai_keys", "").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
        assert_eq!(mirror.get("openai_keys").await.as_deref(), Some("sk-1"));
    }

    #[tokio::test]
    async fn static_validator_uses_table_then_default() {
        let validator = StaticValidator::all_live();
        validator.set("sk-dead", Verdict::Dead).await;
        validator
            .set("sk-flaky", Verdict::TransportError("timeout".into()))
            .await;

        assert_eq!(validator.validate("sk-dead").await, Verdict::Dead);
        assert_eq!(validator.validate("sk-other").await, Verdict::Live);
        assert!(matches!(
            validator.validate("sk-flaky").await,
            Verdict::TransportError(_)
        ));
        assert_eq!(validator.calls(), 3);
    }

    #[tokio::test]
    async fn noop_source_returns_nothing() {
        assert!(NoopSource.acquire(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_notifier_does_not_panic() {
        LogNotifier.notify("cron", "pool is empty").await;
    }
}
