//! Upstream endpoints and protocol limits

/// Default liveness probe: the billing subscription endpoint rejects revoked or
/// drained keys with 401/403 and answers 200 for usable ones.
pub const DEFAULT_VALIDATION_ENDPOINT: &str =
    "https://openkey.cloud/v1/dashboard/billing/subscription";

/// Cloudflare REST API base (v4)
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare caps bulk deletes at 10 000 keys per request.
pub const BULK_DELETE_CHUNK: usize = 10_000;

/// Page size for key listings (Cloudflare maximum is 1000).
pub const LIST_PAGE_LIMIT: usize = 1000;

/// User-Agent sent on every outbound request
pub const USER_AGENT: &str = concat!("keypool-bot/", env!("CARGO_PKG_VERSION"));
