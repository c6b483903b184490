// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{Checkpoint, CheckpointStore, SessionLease};
use crate::stepwise::workflow::error::StoreError;

const EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";

/// One JSON file per session under a directory.
///
/// Saves go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous checkpoint intact. A running step
/// holds `<session>.lock` next to the checkpoint; a process killed without
/// unwinding leaves it behind and it has to be removed by hand.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the checkpoint file for `session_id`
    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.{}", session_id, EXTENSION)))
    }

    pub fn lock_path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.{}", session_id, LOCK_EXTENSION)))
    }
}

/// Session ids become file names, so only a conservative alphabet is allowed
fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.path_for(session_id)?;
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let path = self.path_for(&checkpoint.session_id)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            checkpoint.session_id,
            uuid::Uuid::new_v4()
        ));

        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::io(&path, e));
        }

        log::debug!(
            "Saved checkpoint for session '{}' at '{}' (seq {})",
            checkpoint.session_id,
            checkpoint.cursor,
            checkpoint.sequence
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_session_id(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn try_lock(&self, session_id: &str) -> Result<SessionLease, StoreError> {
        let path = self.lock_path_for(session_id)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked {
                    session: session_id.to_string(),
                    lock: path.display().to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let owner = format!("{}\n", std::process::id());
        if let Err(e) = file.write_all(owner.as_bytes()).await {
            let _ = fs::remove_file(&path).await;
            return Err(StoreError::io(&path, e));
        }

        log::debug!("Locked session '{}' at '{}'", session_id, path.display());
        Ok(SessionLease::new(move || release_lock(&path)))
    }
}

fn release_lock(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            log::warn!("Failed to remove lock '{}': {}", path.display(), e);
        }
    }
}
