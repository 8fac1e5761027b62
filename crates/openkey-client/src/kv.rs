//! Cloudflare Workers KV client
//!
//! The mirror is one KV namespace. Three calls are needed:
//! 1. `PUT  .../values/{key}`   overwrite a value (the live snapshot)
//! 2. `GET  .../keys?prefix=`   list keys, cursor-paginated (known-dead markers)
//! 3. `POST .../bulk/delete`    delete up to 10 000 keys per request
//!
//! Every response uses the v4 envelope `{success, errors, result, result_info}`.
//! A 2xx with `success: false` is treated the same as a non-2xx status.

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::{BULK_DELETE_CHUNK, LIST_PAGE_LIMIT, USER_AGENT};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    name: String,
}

/// Client for a single KV namespace.
pub struct KvClient {
    client: reqwest::Client,
    namespace_url: String,
    api_token: Secret<String>,
}

impl KvClient {
    /// `api_base` is normally `CLOUDFLARE_API_BASE`; tests point it at a mock.
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        account_id: &str,
        namespace_id: &str,
        api_token: Secret<String>,
    ) -> Self {
        let namespace_url = format!(
            "{}/accounts/{account_id}/storage/kv/namespaces/{namespace_id}",
            api_base.trim_end_matches('/')
        );
        Self {
            client,
            namespace_url,
            api_token,
        }
    }

    /// Overwrite `key` with `value`.
    pub async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let url = self.endpoint(&["values", key])?;
        let response = self
            .client
            .put(url)
            .bearer_auth(self.api_token.expose())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| Error::Http(format!("kv put failed: {e}")))?;

        let _: Envelope<serde_json::Value> = read_envelope(response).await?;
        debug!(key, bytes = value.len(), "kv value written");
        Ok(())
    }

    /// All key names starting with `prefix`, following cursors to the end.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.endpoint(&["keys"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                query.append_pair("limit", &LIST_PAGE_LIMIT.to_string());
                if let Some(ref c) = cursor {
                    query.append_pair("cursor", c);
                }
            }

            let response = self
                .client
                .get(url)
                .bearer_auth(self.api_token.expose())
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .send()
                .await
                .map_err(|e| Error::Http(format!("kv list failed: {e}")))?;

            let envelope: Envelope<Vec<KeyEntry>> = read_envelope(response).await?;
            let page = envelope
                .result
                .ok_or_else(|| Error::Parse("kv list response has no result".into()))?;
            let page_len = page.len();
            names.extend(page.into_iter().map(|k| k.name));

            cursor = envelope
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() || page_len == 0 {
                break;
            }
        }

        debug!(prefix, count = names.len(), "kv keys listed");
        Ok(names)
    }

    /// Delete `keys`, chunked to the API limit. Missing keys are ignored upstream.
    pub async fn bulk_delete(&self, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(BULK_DELETE_CHUNK) {
            let url = self.endpoint(&["bulk", "delete"])?;
            let response = self
                .client
                .post(url)
                .bearer_auth(self.api_token.expose())
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .json(chunk)
                .send()
                .await
                .map_err(|e| Error::Http(format!("kv bulk delete failed: {e}")))?;

            let _: Envelope<serde_json::Value> = read_envelope(response).await?;
            debug!(count = chunk.len(), "kv keys deleted");
        }
        Ok(())
    }

    /// Namespace URL with percent-encoded path segments appended.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.namespace_url)
            .map_err(|e| Error::Parse(format!("invalid kv namespace url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Parse("kv namespace url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Decode the v4 envelope, turning HTTP and API-level failures into `Error::Api`.
async fn read_envelope<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Envelope<T>> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading kv response: {e}")))?;

    if !status.is_success() {
        return Err(Error::Api {
            status: status.as_u16(),
            body,
        });
    }

    let envelope: Envelope<T> = serde_json::from_str(&body)
        .map_err(|e| Error::Parse(format!("invalid kv response: {e}")))?;

    if !envelope.success {
        let messages: Vec<String> = envelope
            .errors
            .iter()
            .map(|m| format!("{}: {}", m.code, m.message))
            .collect();
        return Err(Error::Api {
            status: status.as_u16(),
            body: messages.join("; "),
        });
    }

    Ok(envelope)
}
