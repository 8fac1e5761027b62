//! Token inbox: a drop file fed by out-of-process acquisition scripts
//!
//! Mailbox scrapers append one raw token per line. `take()` claims the file by
//! renaming it, keeps up to `max` tokens and appends the unclaimed rest back to
//! the inbox path, so lines written by a scraper while we hold the claim land
//! in a fresh inbox file instead of being overwritten.
//!
//! Blank lines and lines starting with `#` are ignored.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// File-backed queue of raw tokens.
pub struct TokenInbox {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TokenInbox {
    /// The file does not need to exist yet.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove and return up to `max` tokens in file order.
    pub async fn take(&self, max: usize) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;

        if max == 0 || !self.path.exists() {
            return Ok(Vec::new());
        }

        let claimed = claim_path(&self.path)?;
        tokio::fs::rename(&self.path, &claimed)
            .await
            .map_err(|e| Error::Io(format!("claiming inbox: {e}")))?;

        let contents = tokio::fs::read_to_string(&claimed)
            .await
            .map_err(|e| Error::Io(format!("reading claimed inbox: {e}")))?;

        let mut tokens: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        let rest = if tokens.len() > max {
            tokens.split_off(max)
        } else {
            Vec::new()
        };

        if !rest.is_empty() {
            append_lines(&self.path, &rest).await?;
        }

        tokio::fs::remove_file(&claimed)
            .await
            .map_err(|e| Error::Io(format!("removing claimed inbox: {e}")))?;

        info!(
            path = %self.path.display(),
            taken = tokens.len(),
            remaining = rest.len(),
            "drained token inbox"
        );
        Ok(tokens)
    }
}

/// Sibling path used while a take is in progress.
fn claim_path(path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("inbox path has no parent directory".into()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "inbox".into());
    Ok(dir.join(format!(".{name}.claimed.{}", std::process::id())))
}

/// Append lines to the inbox, creating it with 0600 permissions if needed.
async fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| Error::Io(format!("opening inbox for append: {e}")))?;

    let mut buf = lines.join("\n");
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing inbox: {e}")))?;
    file.flush()
        .await
        .map_err(|e| Error::Io(format!("flushing inbox: {e}")))?;

    debug!(path = %path.display(), count = lines.len(), "returned tokens to inbox");
    Ok(())
}
