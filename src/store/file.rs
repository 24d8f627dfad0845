//! File-based store: one pretty-printed JSON file per pipeline.
//!
//! Layout under the store root:
//! - `<id>.json`: pipeline record
//! - `.current`: id of the selected pipeline
//! - `<id>.lock`: advisory lock held for one pipeline's load → mutate → save
//! - `.lock`: advisory lock held while creating or deleting records
//!
//! Saves write a temp file in the same directory, fsync it, and rename it
//! over the record, so readers never observe a partial write.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::debug;

use super::{decode, encode, lock_file, PipelineStore, RecordLock};
use crate::core::error::{EngineError, Result};
use crate::domain::{validate_identifier, Pipeline};

const RECORD_EXT: &str = "json";
const LOCK_EXT: &str = "lock";
const LOCK_FILE: &str = ".lock";
const CURRENT_FILE: &str = ".current";

/// Directory-backed pipeline store
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            EngineError::persistence(format!("create store directory {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for `id`
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, RECORD_EXT))
    }

    /// Path of the per-record lock file for `id`
    pub fn lock_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, LOCK_EXT))
    }
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::persistence("storage task", e))?
}

/// Take the store-wide advisory lock; released when the file is dropped
fn lock_store(root: &Path) -> Result<File> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| EngineError::persistence(format!("open lock file {}", path.display()), e))?;
    file.lock_exclusive()
        .map_err(|e| EngineError::persistence("acquire store lock", e))?;
    Ok(file)
}

/// Write `contents` to `path` via temp file + rename
fn write_atomic(dir: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl PipelineStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn create(&self, id: &str) -> Result<Pipeline> {
        let pipeline = Pipeline::new(id)?;
        let body = encode(&pipeline)?;
        let root = self.root.clone();
        let path = self.record_path(id);
        let id = id.to_string();

        blocking(move || {
            let _lock = lock_store(&root)?;
            if path.exists() {
                return Err(EngineError::AlreadyExists(id));
            }
            write_atomic(&root, &path, body.as_bytes())
                .map_err(|e| EngineError::persistence(format!("write pipeline '{}'", id), e))
        })
        .await?;

        debug!(pipeline = %pipeline.id(), "Created pipeline record");
        Ok(pipeline)
    }

    async fn load(&self, id: &str) -> Result<Pipeline> {
        validate_identifier(id)?;
        let path = self.record_path(id);

        let body = match fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::PipelineNotFound(id.to_string()))
            }
            Err(e) => {
                return Err(EngineError::persistence(
                    format!("read pipeline '{}'", id),
                    e,
                ))
            }
        };

        decode(id, &body)
    }

    async fn save(&self, pipeline: &Pipeline) -> Result<()> {
        let body = encode(pipeline)?;
        let root = self.root.clone();
        let path = self.record_path(pipeline.id());
        let id = pipeline.id().to_string();

        blocking(move || {
            write_atomic(&root, &path, body.as_bytes())
                .map_err(|e| EngineError::persistence(format!("write pipeline '{}'", id), e))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        validate_identifier(id)?;
        let root = self.root.clone();
        let path = self.record_path(id);
        let id = id.to_string();

        blocking(move || {
            let _lock = lock_store(&root)?;
            remove_if_present(&path)
                .map_err(|e| EngineError::persistence(format!("delete pipeline '{}'", id), e))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| EngineError::persistence("list store directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::persistence("list store directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_identifier(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn current(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)).await {
            Ok(content) => {
                let id = content.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::persistence("read current pipeline", e)),
        }
    }

    async fn set_current(&self, id: Option<&str>) -> Result<()> {
        if let Some(id) = id {
            validate_identifier(id)?;
        }
        let root = self.root.clone();
        let path = root.join(CURRENT_FILE);
        let id = id.map(str::to_string);

        blocking(move || {
            let result = match id {
                Some(id) => write_atomic(&root, &path, id.as_bytes()),
                None => remove_if_present(&path),
            };
            result.map_err(|e| EngineError::persistence("write current pipeline", e))
        })
        .await
    }

    async fn lock_record(&self, id: &str) -> Result<RecordLock> {
        validate_identifier(id)?;
        lock_file(self.lock_path(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PipelineState, Stage, StageConfig};
    use tempfile::TempDir;

    fn create_test_store() -> (FileStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path().join("pipelines")).unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_create_writes_record() {
        let (store, _temp) = create_test_store();
        store.create("p1").await.unwrap();

        let raw = std::fs::read_to_string(store.record_path("p1")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["id"], "p1");
        assert_eq!(value["state"], "unbuilt");
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (store, _temp) = create_test_store();
        store.create("p1").await.unwrap();

        let err = store.create("p1").await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(ref id) if id == "p1"));
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let (store, _temp) = create_test_store();
        let mut pipeline = store.create("p1").await.unwrap();
        pipeline
            .append_stage(Stage::new("a", "compute", StageConfig::new()))
            .unwrap();
        store.save(&pipeline).await.unwrap();

        let loaded = store.load("p1").await.unwrap();
        assert_eq!(loaded.stage_order(), vec!["a"]);
        assert_eq!(loaded.state(), PipelineState::Unbuilt);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let (store, _temp) = create_test_store();
        let pipeline = store.create("p1").await.unwrap();
        for _ in 0..3 {
            store.save(&pipeline).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| !n.ends_with(".lock"))
            .collect();
        assert_eq!(names, vec!["p1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupt() {
        let (store, _temp) = create_test_store();
        let err = store.load("ghost").await.unwrap_err();
        assert!(err.is_pipeline_missing());

        std::fs::write(store.record_path("broken"), "{ truncated").unwrap();
        let err = store.load("broken").await.unwrap_err();
        assert_eq!(err.kind(), "persistence_failure");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, _temp) = create_test_store();
        store.create("p1").await.unwrap();

        store.delete("p1").await.unwrap();
        store.delete("p1").await.unwrap();
        store.delete("never-existed").await.unwrap();
        assert!(store.load("p1").await.unwrap_err().is_pipeline_missing());
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_files() {
        let (store, _temp) = create_test_store();
        store.create("b").await.unwrap();
        store.create("a").await.unwrap();
        std::fs::write(store.root().join("notes.txt"), "hi").unwrap();
        std::fs::write(store.root().join(".tmpXYZ"), "partial").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_record_lock_spans_store_handles() {
        let (store, _temp) = create_test_store();
        store.create("p1").await.unwrap();
        let other = FileStore::open(store.root()).unwrap();

        let held = store.lock_record("p1").await.unwrap();
        let waiter = tokio::spawn(async move { other.lock_record("p1").await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let acquired = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());

        // Lock files never show up as pipelines
        assert_eq!(store.list().await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_record_lock_rejects_bad_ids() {
        let (store, _temp) = create_test_store();
        let err = store.lock_record("../escape").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_current_pointer() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.current().await.unwrap(), None);

        store.set_current(Some("p1")).await.unwrap();
        assert_eq!(store.current().await.unwrap(), Some("p1".to_string()));

        store.set_current(None).await.unwrap();
        assert_eq!(store.current().await.unwrap(), None);
        store.set_current(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("pipelines");
        {
            let store = FileStore::open(&root).unwrap();
            store.create("p1").await.unwrap();
        }
        let reopened = FileStore::open(&root).unwrap();
        assert_eq!(reopened.load("p1").await.unwrap().id(), "p1");
    }
}
