//! HTTP- and file-backed collaborators
//!
//! Adapts the raw calls in `openkey_client` to the `upstream` traits the pool
//! is written against.

use std::future::Future;
use std::pin::Pin;

use openkey_client::{KvClient, TokenInbox};
use tracing::{debug, warn};
use upstream::{CredentialSource, Mirror, Notifier, UpstreamError, Validator, Verdict};

/// Map a client error onto the collaborator error space.
fn upstream_error(e: openkey_client::Error) -> UpstreamError {
    if e.is_transient() {
        UpstreamError::Transport(e.to_string())
    } else {
        match e {
            openkey_client::Error::Api { .. } => UpstreamError::Rejected(e.to_string()),
            other => UpstreamError::Internal(other.to_string()),
        }
    }
}

/// Probes the billing subscription endpoint with the token as Bearer.
pub struct HttpValidator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpValidator {
    /// `client` should carry the per-call timeout.
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

impl Validator for HttpValidator {
    fn id(&self) -> &str {
        "http"
    }

    fn validate<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Verdict> + Send + 'a>> {
        Box::pin(async move {
            match openkey_client::probe_subscription(&self.client, &self.endpoint, token).await {
                Ok(reply) => key_pool::classify_status(reply.status, &reply.body),
                Err(e) => Verdict::TransportError(e.to_string()),
            }
        })
    }
}

/// Cloudflare KV namespace as the pool mirror.
pub struct KvMirror {
    client: KvClient,
}

impl KvMirror {
    pub fn new(client: KvClient) -> Self {
        Self { client }
    }
}

impl Mirror for KvMirror {
    fn id(&self) -> &str {
        "cloudflare"
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<()>> + Send + 'a>> {
        Box::pin(async move { self.client.put_value(key, value).await.map_err(upstream_error) })
    }

    fn list_keys<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move { self.client.list_keys(prefix).await.map_err(upstream_error) })
    }

    fn bulk_delete<'a>(
        &'a self,
        keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = upstream::Result<()>> + Send + 'a>> {
        Box::pin(async move { self.client.bulk_delete(keys).await.map_err(upstream_error) })
    }
}

/// Drains the token inbox file.
pub struct InboxSource {
    inbox: TokenInbox,
}

impl InboxSource {
    pub fn new(inbox: TokenInbox) -> Self {
        Self { inbox }
    }
}

impl CredentialSource for InboxSource {
    fn id(&self) -> &str {
        "inbox"
    }

    fn acquire(
        &self,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            let tokens = self.inbox.take(max_count).await.map_err(upstream_error)?;
            debug!(
                path = %self.inbox.path().display(),
                count = tokens.len(),
                "drained token inbox"
            );
            Ok(tokens)
        })
    }
}

/// POSTs `{"title", "text"}` to a webhook. Failures are logged and dropped.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

impl Notifier for WebhookNotifier {
    fn notify<'a>(
        &'a self,
        title: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let payload = serde_json::json!({ "title": title, "text": text });
            match self
                .client
                .post(&self.url)
                .header(reqwest::header::USER_AGENT, openkey_client::USER_AGENT)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!(title, "notification delivered");
                }
                Ok(response) => {
                    warn!(title, status = response.status().as_u16(), "webhook rejected notification");
                }
                Err(e) => {
                    warn!(title, error = %e, "webhook delivery failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Mock billing endpoint keyed on the Bearer token.
    async fn start_probe_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                match auth {
                    "Bearer sk-live" => (StatusCode::OK, r#"{"has_payment_method":true}"#),
                    "Bearer sk-revoked" => (StatusCode::UNAUTHORIZED, "invalid api key"),
                    "Bearer sk-drained" => (
                        StatusCode::TOO_MANY_REQUESTS,
                        r#"{"error":{"code":"insufficient_quota"}}"#,
                    ),
                    "Bearer sk-busy" => (StatusCode::TOO_MANY_REQUESTS, "slow down"),
                    _ => (StatusCode::BAD_GATEWAY, "bad gateway"),
                }
            });
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/dashboard/billing/subscription")
    }

    #[tokio::test]
    async fn http_validator_classifies_responses() {
        let endpoint = start_probe_server().await;
        let validator = HttpValidator::new(reqwest::Client::new(), endpoint);

        assert_eq!(validator.validate("sk-live").await, Verdict::Live);
        assert_eq!(validator.validate("sk-revoked").await, Verdict::Dead);
        assert_eq!(validator.validate("sk-drained").await, Verdict::Dead);
        assert!(matches!(
            validator.validate("sk-busy").await,
            Verdict::TransportError(_)
        ));
        assert!(matches!(
            validator.validate("sk-other").await,
            Verdict::TransportError(_)
        ));
    }

    #[tokio::test]
    async fn http_validator_unreachable_is_transport_error() {
        let validator = HttpValidator::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/v1/dashboard/billing/subscription".into(),
        );
        assert!(matches!(
            validator.validate("sk-live").await,
            Verdict::TransportError(_)
        ));
    }

    #[test]
    fn client_errors_map_by_transience() {
        assert!(matches!(
            upstream_error(openkey_client::Error::Http("reset".into())),
            UpstreamError::Transport(_)
        ));
        assert!(matches!(
            upstream_error(openkey_client::Error::Api {
                status: 503,
                body: String::new()
            }),
            UpstreamError::Transport(_)
        ));
        assert!(matches!(
            upstream_error(openkey_client::Error::Api {
                status: 403,
                body: "forbidden".into()
            }),
            UpstreamError::Rejected(_)
        ));
        assert!(matches!(
            upstream_error(openkey_client::Error::Io("denied".into())),
            UpstreamError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn inbox_source_takes_up_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.txt");
        std::fs::write(&path, "sk-a\nsk-b\nsk-c\n").unwrap();
        let source = InboxSource::new(TokenInbox::new(path));

        let first = source.acquire(2).await.unwrap();
        assert_eq!(first, vec!["sk-a", "sk-b"]);
        let rest = source.acquire(5).await.unwrap();
        assert_eq!(rest, vec!["sk-c"]);
        assert!(source.acquire(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_notifier_posts_title_and_text() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/hook",
                axum::routing::post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().await.push(body);
                        StatusCode::NO_CONTENT
                    }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let notifier = WebhookNotifier::new(reqwest::Client::new(), format!("http://{addr}/hook"));
        notifier.notify("validate", "key removed").await;

        let bodies = received.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["title"], "validate");
        assert_eq!(bodies[0]["text"], "key removed");
    }

    #[tokio::test]
    async fn webhook_failure_is_swallowed() {
        let notifier = WebhookNotifier::new(reqwest::Client::new(), "http://127.0.0.1:1/hook".into());
        // Must return without panicking
        notifier.notify("validate", "unreachable").await;
    }
}
