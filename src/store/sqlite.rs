//! SQLite store: one row per pipeline, JSON body.
//!
//! Per-pipeline locks live next to the database as `<db>.locks/<id>.lock`
//! so that processes sharing the file also share the locks. The database
//! connection itself only ever holds short statement-level transactions.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{decode, encode, lock_file, PipelineStore, RecordLock};
use crate::core::error::{EngineError, Result};
use crate::core::locks::KeyedLocks;
use crate::domain::{validate_identifier, Pipeline};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pipelines (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );
";

const CURRENT_KEY: &str = "current_pipeline";

/// Single-connection SQLite store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    /// Lock directory for file databases; `None` for private in-memory ones
    lock_dir: Option<PathBuf>,
    local_locks: Arc<KeyedLocks>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if needed) a database file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::persistence(format!("create directory {}", parent.display()), e)
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            EngineError::persistence(format!("open database {}", path.display()), e)
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| EngineError::persistence("configure database", e))?;

        let lock_dir = Self::lock_dir_for(path);
        std::fs::create_dir_all(&lock_dir).map_err(|e| {
            EngineError::persistence(format!("create lock directory {}", lock_dir.display()), e)
        })?;
        Self::init(conn, Some(lock_dir))
    }

    /// `<db>.locks`, beside the database file
    fn lock_dir_for(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".locks");
        PathBuf::from(name)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::persistence("open in-memory database", e))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, lock_dir: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| EngineError::persistence("initialize schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_dir,
            local_locks: Arc::new(KeyedLocks::new()),
        })
    }

    /// Run `work` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            work(&conn)
        })
        .await
        .map_err(|e| EngineError::persistence("storage task", e))?
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, id: &str) -> Result<Pipeline> {
        let pipeline = Pipeline::new(id)?;
        let body = encode(&pipeline)?;
        let id = id.to_string();
        let updated_at = pipeline.updated_at.to_rfc3339();

        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO pipelines (id, body, updated_at) VALUES (?1, ?2, ?3)",
                    params![id, body, updated_at],
                )
                .map_err(|e| EngineError::persistence(format!("insert pipeline '{}'", id), e))?;
            if inserted == 0 {
                return Err(EngineError::AlreadyExists(id));
            }
            Ok(())
        })
        .await?;

        Ok(pipeline)
    }

    async fn load(&self, id: &str) -> Result<Pipeline> {
        validate_identifier(id)?;
        let id = id.to_string();

        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM pipelines WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| EngineError::persistence(format!("read pipeline '{}'", id), e))?;

            match body {
                Some(body) => decode(&id, &body),
                None => Err(EngineError::PipelineNotFound(id)),
            }
        })
        .await
    }

    async fn save(&self, pipeline: &Pipeline) -> Result<()> {
        let body = encode(pipeline)?;
        let id = pipeline.id().to_string();
        let updated_at = pipeline.updated_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pipelines (id, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![id, body, updated_at],
            )
            .map_err(|e| EngineError::persistence(format!("write pipeline '{}'", id), e))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        validate_identifier(id)?;
        let id = id.to_string();

        self.with_conn(move |conn| {
            conn.execute("DELETE FROM pipelines WHERE id = ?1", params![id])
                .map_err(|e| EngineError::persistence(format!("delete pipeline '{}'", id), e))?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM pipelines ORDER BY id")
                .map_err(|e| EngineError::persistence("list pipelines", e))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| EngineError::persistence("list pipelines", e))?;
            Ok(ids)
        })
        .await
    }

    async fn current(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value: Option<Option<String>> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![CURRENT_KEY],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| EngineError::persistence("read current pipeline", e))?;
            Ok(value.flatten())
        })
        .await
    }

    async fn set_current(&self, id: Option<&str>) -> Result<()> {
        if let Some(id) = id {
            validate_identifier(id)?;
        }
        let id = id.map(str::to_string);

        self.with_conn(move |conn| {
            let result = match id {
                Some(id) => conn.execute(
                    "INSERT INTO meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![CURRENT_KEY, id],
                ),
                None => conn.execute("DELETE FROM meta WHERE key = ?1", params![CURRENT_KEY]),
            };
            result.map_err(|e| EngineError::persistence("write current pipeline", e))?;
            Ok(())
        })
        .await
    }

    async fn lock_record(&self, id: &str) -> Result<RecordLock> {
        validate_identifier(id)?;
        match &self.lock_dir {
            Some(dir) => lock_file(dir.join(format!("{}.lock", id))).await,
            None => Ok(RecordLock::Local(self.local_locks.acquire(id).await)),
        }
    }
}
