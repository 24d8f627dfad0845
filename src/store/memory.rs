//! In-memory store (for testing or ephemeral use).
//!
//! Records are kept serialized so loads hand out independent snapshots,
//! the same as a durable backend would.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{decode, encode, PipelineStore, RecordLock};
use crate::core::error::{EngineError, Result};
use crate::core::locks::KeyedLocks;
use crate::domain::{validate_identifier, Pipeline};

/// Process-local pipeline store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, String>>,
    current: RwLock<Option<String>>,
    record_locks: KeyedLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, id: &str) -> Result<Pipeline> {
        let pipeline = Pipeline::new(id)?;
        let body = encode(&pipeline)?;

        let mut records = self.records.write().await;
        if records.contains_key(id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }
        records.insert(id.to_string(), body);

        Ok(pipeline)
    }

    async fn load(&self, id: &str) -> Result<Pipeline> {
        let records = self.records.read().await;
        let body = records
            .get(id)
            .ok_or_else(|| EngineError::PipelineNotFound(id.to_string()))?;
        decode(id, body)
    }

    async fn save(&self, pipeline: &Pipeline) -> Result<()> {
        let body = encode(pipeline)?;
        let mut records = self.records.write().await;
        records.insert(pipeline.id().to_string(), body);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        records.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn current(&self) -> Result<Option<String>> {
        Ok(self.current.read().await.clone())
    }

    async fn set_current(&self, id: Option<&str>) -> Result<()> {
        if let Some(id) = id {
            validate_identifier(id)?;
        }
        *self.current.write().await = id.map(str::to_string);
        Ok(())
    }

    async fn lock_record(&self, id: &str) -> Result<RecordLock> {
        validate_identifier(id)?;
        Ok(RecordLock::Local(self.record_locks.acquire(id).await))
    }
}
