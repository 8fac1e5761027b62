//! Collaborator seams for the key pool
//!
//! The pool core never talks HTTP itself. Everything outside the process is
//! reached through the dyn-compatible traits defined here:
//! - `Validator` answers "is this credential still authorized"
//! - `Mirror` is the eventually-consistent external key-value store
//! - `CredentialSource` hands over freshly acquired raw tokens
//! - `Notifier` delivers operator-facing messages from background ticks
//!
//! Traits return `Pin<Box<dyn Future>>` so they can be held as `Arc<dyn Trait>`.
//! The in-process implementations in `memory` cover single-node deployments
//! and tests; HTTP-backed implementations live in the bot service.

pub mod memory;

pub use memory::{LogNotifier, MemoryMirror, NoopSource, StaticValidator};

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Outcome of asking the upstream whether a credential is still authorized.
///
/// Only `Dead` may lead to eviction. `TransportError` covers network failures,
/// timeouts, 5xx and anything else that does not prove the credential is gone,
/// so an upstream outage never empties the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum Verdict {
    /// Upstream accepted the credential
    Live,
    /// Upstream explicitly rejected the credential (401/403 semantics)
    Dead,
    /// Could not reach a decision
    TransportError(String),
}

impl Verdict {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Live => "live",
            Verdict::Dead => "dead",
            Verdict::TransportError(_) => "transport_error",
        }
    }
}

/// Errors from collaborator calls.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Network failure, timeout or 5xx; retryable
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream refused the request (bad API token, unknown namespace, ...)
    #[error("rejected by upstream: {0}")]
    Rejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for collaborator calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Liveness check against the system the credentials authorize.
pub trait Validator: Send + Sync {
    /// Identifier for logging (e.g. "http", "static")
    fn id(&self) -> &str;

    /// Check one credential. Never fails: transport problems are a `Verdict`.
    fn validate<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Verdict> + Send + 'a>>;
}

/// External key-value mirror holding a downstream copy of the pool.
///
/// All three calls are best-effort from the pool's point of view and may fail
/// independently of each other.
pub trait Mirror: Send + Sync {
    fn id(&self) -> &str;

    /// Overwrite `key` with `value`.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// List every key starting with `prefix`.
    fn list_keys<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

    /// Delete the given keys. Missing keys are not an error.
    fn bulk_delete<'a>(
        &'a self,
        keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Producer of fresh credentials (mailbox scrapers, faucets, drop files).
///
/// May return fewer tokens than requested, or none. A failure only aborts the
/// current attempt.
pub trait CredentialSource: Send + Sync {
    fn id(&self) -> &str;

    fn acquire(
        &self,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;
}

/// Delivery of operator-facing messages from background work.
///
/// Delivery failures are the notifier's own business: callers never wait on
/// or react to them.
pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        title: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_labels() {
        assert_eq!(Verdict::Live.label(), "live");
        assert_eq!(Verdict::Dead.label(), "dead");
        assert_eq!(
            Verdict::TransportError("timeout".into()).label(),
            "transport_error"
        );
    }

    #[test]
    fn upstream_error_messages() {
        assert_eq!(
            UpstreamError::Transport("connection reset".into()).to_string(),
            "transport error: connection reset"
        );
        assert!(
            UpstreamError::Rejected("10000: authentication error".into())
                .to_string()
                .starts_with("rejected by upstream")
        );
    }
}
