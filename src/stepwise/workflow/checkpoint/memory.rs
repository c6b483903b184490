// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointStore, SessionLease};
use crate::stepwise::workflow::error::StoreError;

/// In-process store; clones share the same map
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    leased: Arc<Mutex<HashSet<String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(session_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        Ok(checkpoints.remove(session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        let mut ids: Vec<String> = checkpoints.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn try_lock(&self, session_id: &str) -> Result<SessionLease, StoreError> {
        let inserted = self
            .leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string());
        if !inserted {
            return Err(StoreError::Locked {
                session: session_id.to_string(),
                lock: "memory".to_string(),
            });
        }
        let leased = self.leased.clone();
        let session_id = session_id.to_string();
        Ok(SessionLease::new(move || {
            leased
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&session_id);
        }))
    }
}
