//! Durable pipeline storage.
//!
//! A store maps pipeline ids to serialized pipeline records. It is the
//! single source of truth between process invocations; in-memory
//! `Pipeline` values are short-lived copies of one record.
//!
//! Backends:
//! - `FileStore`: one JSON file per pipeline, atomic rename on save
//! - `SqliteStore`: one row per pipeline
//! - `MemoryStore`: process-local, for tests and ephemeral use

pub mod file;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::core::error::{EngineError, Result};
use crate::domain::Pipeline;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage contract for pipeline records
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    /// Write an empty pipeline; fails `AlreadyExists` if the id is taken
    async fn create(&self, id: &str) -> Result<Pipeline>;

    /// Read a pipeline; fails `PipelineNotFound` if absent
    async fn load(&self, id: &str) -> Result<Pipeline>;

    /// Atomically replace the record for `pipeline.id()`
    async fn save(&self, pipeline: &Pipeline) -> Result<()>;

    /// Remove a record; succeeds if it is already gone
    async fn delete(&self, id: &str) -> Result<()>;

    /// All stored ids, sorted
    async fn list(&self) -> Result<Vec<String>>;

    /// The pipeline selected when a request omits an id
    async fn current(&self) -> Result<Option<String>>;

    async fn set_current(&self, id: Option<&str>) -> Result<()>;

    /// Hold `id` exclusively until the returned lock is dropped.
    ///
    /// Shared backends make the hold visible to every process using the
    /// same store, so a load → mutate → save cycle cannot interleave with
    /// another process's cycle on the same pipeline.
    async fn lock_record(&self, id: &str) -> Result<RecordLock>;
}

/// Exclusive hold on one pipeline id; released on drop
#[derive(Debug)]
pub enum RecordLock {
    /// Advisory lock on a per-id lock file, visible across processes
    File(File),
    /// Process-local hold for stores nothing else can open
    Local(OwnedMutexGuard<()>),
}

/// Block until an exclusive advisory lock on `path` is held
pub(crate) async fn lock_file(path: PathBuf) -> Result<RecordLock> {
    tokio::task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                EngineError::persistence(format!("open lock file {}", path.display()), e)
            })?;
        file.lock_exclusive().map_err(|e| {
            EngineError::persistence(format!("acquire lock {}", path.display()), e)
        })?;
        Ok(RecordLock::File(file))
    })
    .await
    .map_err(|e| EngineError::persistence("storage task", e))?
}

/// Serialize a pipeline record
pub fn encode(pipeline: &Pipeline) -> Result<String> {
    serde_json::to_string_pretty(pipeline)
        .map_err(|e| EngineError::persistence(format!("encode pipeline '{}'", pipeline.id()), e))
}

/// Deserialize a pipeline record
pub fn decode(id: &str, body: &str) -> Result<Pipeline> {
    serde_json::from_str(body)
        .map_err(|e| EngineError::persistence(format!("decode pipeline '{}'", id), e))
}

/// Which storage backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Sqlite,
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::File
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        })
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!(
                "unknown store backend '{}' (expected file, sqlite or memory)",
                other
            )),
        }
    }
}

/// Open a store for the given backend rooted at `path`
pub fn open(backend: StoreBackend, path: &Path) -> Result<Arc<dyn PipelineStore>> {
    Ok(match backend {
        StoreBackend::File => Arc::new(FileStore::open(path)?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(path)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    })
}
