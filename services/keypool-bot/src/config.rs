//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The mirror API token is loaded from CF_API_TOKEN or api_token_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Pool storage and lifetime
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub state_path: PathBuf,
    /// Maximum member age; 2.8 days by default
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// Pins the push window's young edge. When unset it is the spacing of
    /// `schedule.acquire` and follows that job across reschedules.
    pub acquire_interval_secs: Option<u64>,
    #[serde(default = "default_acquire_batch")]
    pub acquire_batch: usize,
}

/// Liveness probe settings
#[derive(Debug, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_validator_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    Cloudflare,
    #[default]
    Memory,
}

/// External mirror settings
#[derive(Debug, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub kind: MirrorKind,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub namespace_id: Option<String>,
    #[serde(skip)]
    pub api_token: Option<Secret<String>>,
    /// Path to a file containing the API token (alternative to CF_API_TOKEN env var)
    #[serde(default)]
    pub api_token_file: Option<PathBuf>,
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
    #[serde(default = "default_dead_prefix")]
    pub dead_prefix: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Cron expressions for the built-in jobs
#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_validate_cron")]
    pub validate: String,
    #[serde(default = "default_acquire_cron")]
    pub acquire: String,
    #[serde(default = "default_reconcile_cron")]
    pub reconcile: String,
}

/// Operator API listener
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotifyConfig {
    /// Operator messages are POSTed here; logged only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AcquisitionConfig {
    /// Drop file that acquisition scripts append tokens to
    #[serde(default)]
    pub inbox_path: Option<PathBuf>,
}

fn default_ttl() -> u64 {
    241_920
}

/// Used when `schedule.acquire` never fires twice.
const FALLBACK_ACQUIRE_INTERVAL: Duration = Duration::from_secs(3_600);

fn default_acquire_batch() -> usize {
    1
}

fn default_validator_endpoint() -> String {
    openkey_client::DEFAULT_VALIDATION_ENDPOINT.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_api_base() -> String {
    openkey_client::CLOUDFLARE_API_BASE.to_string()
}

fn default_snapshot_key() -> String {
    "openai_keys".to_string()
}

fn default_dead_prefix() -> String {
    "expired:".to_string()
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_validate_cron() -> String {
    "*/10 * * * *".to_string()
}

fn default_acquire_cron() -> String {
    "0 * * * *".to_string()
}

fn default_reconcile_cron() -> String {
    "*/30 * * * *".to_string()
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_validator_endpoint(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            kind: MirrorKind::default(),
            api_base: default_api_base(),
            account_id: None,
            namespace_id: None,
            api_token: None,
            api_token_file: None,
            snapshot_key: default_snapshot_key(),
            dead_prefix: default_dead_prefix(),
            delimiter: default_delimiter(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            validate: default_validate_cron(),
            acquire: default_acquire_cron(),
            reconcile: default_reconcile_cron(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_addr(),
            max_connections: default_max_connections(),
        }
    }
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API token resolution order:
    /// 1. CF_API_TOKEN env var
    /// 2. mirror.api_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.pool.ttl_secs == 0 {
            return Err(common::Error::Config(
                "pool.ttl_secs must be greater than 0".into(),
            ));
        }
        if config.validator.timeout_secs == 0 || config.mirror.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if config.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "admin.max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.acquire_interval_secs == Some(0) {
            return Err(common::Error::Config(
                "pool.acquire_interval_secs must be greater than 0".into(),
            ));
        }

        require_http_url("validator.endpoint", &config.validator.endpoint)?;
        require_http_url("mirror.api_base", &config.mirror.api_base)?;
        if let Some(ref url) = config.notify.webhook_url {
            require_http_url("notify.webhook_url", url)?;
        }

        for (job, expression) in [
            ("validate", &config.schedule.validate),
            ("acquire", &config.schedule.acquire),
            ("reconcile", &config.schedule.reconcile),
        ] {
            key_pool::parse_expression(expression)
                .map_err(|e| common::Error::Config(format!("schedule.{job}: {e}")))?;
        }

        // Resolve API token: env var takes precedence over file
        if let Ok(token) = std::env::var("CF_API_TOKEN") {
            config.mirror.api_token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.mirror.api_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.mirror.api_token = Some(Secret::new(token));
            }
        }

        if config.mirror.kind == MirrorKind::Cloudflare {
            if config.mirror.account_id.as_deref().is_none_or(str::is_empty)
                || config.mirror.namespace_id.as_deref().is_none_or(str::is_empty)
            {
                return Err(common::Error::Config(
                    "cloudflare mirror requires mirror.account_id and mirror.namespace_id".into(),
                ));
            }
            if config.mirror.api_token.is_none() {
                return Err(common::Error::Config(
                    "cloudflare mirror requires CF_API_TOKEN or mirror.api_token_file".into(),
                ));
            }
        }

        Ok(config)
    }

    /// Spacing of the acquire job as the push window sees it.
    pub fn acquire_interval(&self) -> Duration {
        if let Some(secs) = self.pool.acquire_interval_secs {
            return Duration::from_secs(secs);
        }
        match key_pool::fire_spacing(&self.schedule.acquire) {
            Ok(Some(spacing)) => spacing,
            _ => FALLBACK_ACQUIRE_INTERVAL,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("keypool-bot.toml")
    }
}
