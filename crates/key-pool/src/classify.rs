//! Liveness classification for validation probe responses
//!
//! A probe answer only counts as `Dead` when the upstream says the credential
//! itself is unusable. Rate limits, timeouts and server errors say nothing
//! about the credential and map to `TransportError`.

use upstream::Verdict;

/// Phrases in a 429 body meaning the account is out of quota for good.
const QUOTA_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "exceeded your current quota",
    "billing hard limit",
    "quota exceeded",
];

/// Classify a 429 body as exhausted quota (`Dead`) or a plain rate limit.
pub fn classify_429(body: &str) -> Verdict {
    let lower = body.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return Verdict::Dead;
        }
    }
    Verdict::TransportError("rate limited (429)".into())
}

/// Classify a probe response by HTTP status and body.
///
/// 2xx → `Live`. 401/402/403 → `Dead`. 429 depends on the body. Everything
/// else, 408 and 5xx included, is a `TransportError` carrying the status.
pub fn classify_status(status: u16, body: &str) -> Verdict {
    match status {
        200..=299 => Verdict::Live,
        401 | 402 | 403 => Verdict::Dead,
        429 => classify_429(body),
        _ => Verdict::TransportError(format!("unexpected status {status}")),
    }
}
