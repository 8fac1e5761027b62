//! Persistent pool store
//!
//! Two structures live side by side in one JSON state file:
//! - `members`: token → admission time (unix seconds), the scored set used for
//!   sampling and time-window listing
//! - `records`: token → expiring record whose expiry is the admission time
//!   plus the pool TTL
//!
//! Both are updated under a single async mutex and persisted with atomic
//! temp-file + rename, so a crash never leaves one structure ahead of the
//! other on disk. Members outlive their records: a member whose record has
//! expired is still listed by explicit windows but no longer `exists`, and the
//! default window drops it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use common::fingerprint;

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Expiring per-token record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringRecord {
    pub admitted_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PoolState {
    #[serde(default)]
    members: BTreeMap<String, u64>,
    #[serde(default)]
    records: BTreeMap<String, ExpiringRecord>,
}

/// What `admit` did with a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// New member
    Inserted,
    /// Existing member; score is the older of the two admission times
    Refreshed,
    /// Already at or past the TTL; nothing written
    TooStale,
}

impl Admission {
    pub fn label(&self) -> &'static str {
        match self {
            Admission::Inserted => "inserted",
            Admission::Refreshed => "refreshed",
            Admission::TooStale => "too_stale",
        }
    }
}

/// Thread-safe pool state file manager.
pub struct PoolStore {
    path: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

impl PoolStore {
    /// Load the pool from `path`.
    ///
    /// A missing file is a cold start: an empty pool is written so later
    /// loads take the normal path. Records that expired while the process was
    /// down are dropped, as are records without a matching member.
    pub async fn load(path: PathBuf, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading pool file: {e}")))?;
            let mut state: PoolState = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing pool file: {e}")))?;

            let now = clock.now_secs();
            let PoolState { members, records } = &mut state;
            records.retain(|token, record| {
                record.expires_at > now && members.contains_key(token)
            });

            info!(
                path = %path.display(),
                members = state.members.len(),
                current = state.records.len(),
                "loaded pool state"
            );
            state
        } else {
            info!(path = %path.display(), "pool file not found, starting with empty pool");
            let state = PoolState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            ttl,
            clock,
            state: Mutex::new(state),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Admit `token`, observed to be `observed_age` old already.
    ///
    /// The stored admission time is `now - observed_age`, or the existing
    /// member's admission time if that is older: re-admission never makes a
    /// token look younger. The expiring record gets the remaining lifetime;
    /// when none is left the token is rejected as `TooStale` and nothing is
    /// written. If persisting fails the pool is left as it was.
    pub async fn admit(&self, token: &str, observed_age: Duration) -> Result<Admission> {
        let token = normalize(token)?;
        let now = self.clock.now_secs();
        let ttl = self.ttl.as_secs();
        let candidate = now.saturating_sub(observed_age.as_secs());

        let mut state = self.state.lock().await;
        let existing = state.members.get(&token).copied();
        let admitted_at = existing.map_or(candidate, |old| old.min(candidate));

        let age = now.saturating_sub(admitted_at);
        if age >= ttl {
            debug!(
                token = %fingerprint(&token),
                age_secs = age,
                "token past TTL, not admitted"
            );
            return Ok(Admission::TooStale);
        }

        let mut next = state.clone();
        next.members.insert(token.clone(), admitted_at);
        next.records.insert(
            token.clone(),
            ExpiringRecord {
                admitted_at,
                expires_at: now + (ttl - age),
            },
        );
        write_atomic(&self.path, &next).await?;
        *state = next;

        let admission = if existing.is_some() {
            Admission::Refreshed
        } else {
            Admission::Inserted
        };
        debug!(
            token = %fingerprint(&token),
            admitted_at,
            outcome = admission.label(),
            "token admitted"
        );
        Ok(admission)
    }

    /// Remove tokens from both structures.
    ///
    /// Returns how many were members. Absent tokens are ignored; the file is
    /// only rewritten when something changed, and a failed write removes
    /// nothing.
    pub async fn evict(&self, tokens: &[String]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut removed = 0usize;
        let mut gone = Vec::new();
        for token in tokens {
            let token = token.trim();
            let was_member = next.members.remove(token).is_some();
            let had_record = next.records.remove(token).is_some();
            if was_member {
                removed += 1;
            }
            if was_member || had_record {
                gone.push(token);
            }
        }
        if gone.is_empty() {
            return Ok(0);
        }

        write_atomic(&self.path, &next).await?;
        *state = next;
        for token in gone {
            debug!(token = %fingerprint(token), "token evicted");
        }
        Ok(removed)
    }

    /// One member chosen uniformly at random, or `None` on an empty pool.
    pub async fn sample_one(&self) -> Option<String> {
        let state = self.state.lock().await;
        let n = state.members.len();
        if n == 0 {
            return None;
        }
        let idx = rand::rng().random_range(0..n);
        state.members.keys().nth(idx).cloned()
    }

    /// Members with `start <= admitted_at <= end`, oldest first.
    ///
    /// `start` defaults to `now - TTL`; `end` is unbounded by default. Ties
    /// are broken by token so the order is stable.
    pub async fn list_in_window(&self, start: Option<u64>, end: Option<u64>) -> Vec<String> {
        let now = self.clock.now_secs();
        let start = start.unwrap_or_else(|| now.saturating_sub(self.ttl.as_secs()));
        let end = end.unwrap_or(u64::MAX);
        if start > end {
            return Vec::new();
        }

        let state = self.state.lock().await;
        let mut hits: Vec<(u64, &String)> = state
            .members
            .iter()
            .filter(|&(_, &score)| score >= start && score <= end)
            .map(|(token, &score)| (score, token))
            .collect();
        hits.sort();
        hits.into_iter().map(|(_, token)| token.clone()).collect()
    }

    /// Whether `token` has an unexpired record.
    pub async fn exists(&self, token: &str) -> bool {
        let now = self.clock.now_secs();
        let state = self.state.lock().await;
        state
            .records
            .get(token.trim())
            .is_some_and(|record| record.expires_at > now)
    }

    /// Admission time of a member.
    pub async fn admitted_at(&self, token: &str) -> Option<u64> {
        let state = self.state.lock().await;
        state.members.get(token.trim()).copied()
    }

    /// Number of members, expired records included.
    pub async fn len(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Members that still have an unexpired record.
    pub async fn current_len(&self) -> usize {
        let now = self.clock.now_secs();
        let state = self.state.lock().await;
        state
            .records
            .values()
            .filter(|record| record.expires_at > now)
            .count()
    }
}

fn normalize(token: &str) -> Result<String> {
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::InvalidToken("empty token".into()));
    }
    if token.chars().any(char::is_whitespace) {
        return Err(Error::InvalidToken("token contains whitespace".into()));
    }
    Ok(token.to_string())
}

/// Write the pool state atomically: temp file, 0600, rename over the target.
async fn write_atomic(path: &Path, state: &PoolState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Store(format!("serializing pool state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("pool path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".pool.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp pool file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting pool file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp pool file: {e}")))?;

    debug!(path = %path.display(), "persisted pool state");
    Ok(())
}
