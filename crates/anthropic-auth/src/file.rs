//! JSON file backend
//!
//! On hosts without a usable OS secret store the Claude CLI keeps the same
//! record in `~/.claude/.credentials.json`. Writes use atomic temp-file +
//! rename to prevent corruption on crash, and the file is kept at 0600.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::credentials::{BoxFuture, SecretBackend};
use crate::error::{Error, Result};

/// Secret backend over a credential file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretBackend for FileBackend {
    fn id(&self) -> &str {
        "file"
    }

    fn load(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => Ok(Some(contents)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) if e.kind() == ErrorKind::InvalidData => Err(Error::CredentialMalformed(
                    format!("credential file is not valid UTF-8: {e}"),
                )),
                Err(e) => Err(Error::CredentialAccessDenied(format!(
                    "reading {}: {e}",
                    self.path.display()
                ))),
            }
        })
    }

    fn store(&self, payload: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { write_atomic(&self.path, &payload).await })
    }
}

/// Write the payload atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The temp file is created with mode 0600 (owner read/write
/// only) since it holds OAuth tokens.
async fn write_atomic(path: &Path, payload: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::CredentialWriteFailed("credential path has no parent directory".into()))?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::CredentialWriteFailed(format!("creating {}: {e}", dir.display())))?;

    let tmp_path = temp_path(dir);

    // A leftover temp file from a crashed write keeps its old mode, so start fresh.
    match tokio::fs::remove_file(&tmp_path).await {
        Ok(()) => debug!(path = %tmp_path.display(), "removed stale temp credential file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::CredentialWriteFailed(format!(
                "removing stale temp credential file: {e}"
            )));
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&tmp_path)
        .await
        .map_err(|e| Error::CredentialWriteFailed(format!("creating temp credential file: {e}")))?;
    file.write_all(payload.as_bytes())
        .await
        .map_err(|e| Error::CredentialWriteFailed(format!("writing temp credential file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::CredentialWriteFailed(format!("syncing temp credential file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::CredentialWriteFailed(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}

fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".credentials.tmp.{}", std::process::id()))
}
