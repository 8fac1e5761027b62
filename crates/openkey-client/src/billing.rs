//! Credential liveness probe
//!
//! One GET against the upstream's billing subscription endpoint with the
//! candidate key as a Bearer token. The response is returned raw; deciding
//! what a status means for pool membership is the pool's job.

use tracing::debug;

use crate::constants::USER_AGENT;
use crate::error::{Error, Result};

/// Raw status and body of a probe response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    pub status: u16,
    pub body: String,
}

/// Send the probe for `token` to `endpoint`.
///
/// Any HTTP response, success or not, is `Ok`. Only failures to get a
/// response at all (connect, DNS, timeout) are `Error::Http`. The per-call
/// timeout is whatever the supplied client was built with.
pub async fn probe_subscription(
    client: &reqwest::Client,
    endpoint: &str,
    token: &str,
) -> Result<ProbeReply> {
    let response = client
        .get(endpoint)
        .bearer_auth(token)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Error::Http(format!("subscription probe failed: {e}")))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));

    debug!(
        token = %common::fingerprint(token),
        status,
        "subscription probe answered"
    );

    Ok(ProbeReply { status, body })
}
