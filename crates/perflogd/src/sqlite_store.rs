//! SQLite-backed sample store
//!
//! Two tables, one per insert the sampling loop needs:
//!
//! - `subflows`: one row per (iteration, subflow), written on first sight
//! - `subflow_tcp_conn_info`: one row per sample, features as a JSON object

use crate::error::{PerflogError, Result};
use crate::store::{SampleStore, StoreFactory};
use crate::types::{FeatureMap, SubflowId};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn};

/// DDL for the subflow and sample tables
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS subflows (
    iteration_id TEXT NOT NULL,
    subflow_id   INTEGER NOT NULL,
    local_addr   TEXT NOT NULL,
    remote_addr  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (iteration_id, subflow_id)
);
CREATE TABLE IF NOT EXISTS subflow_tcp_conn_info (
    iteration_id TEXT NOT NULL,
    subflow_id   INTEGER NOT NULL,
    recorded_at  TEXT NOT NULL,
    features     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conn_info_iteration
    ON subflow_tcp_conn_info (iteration_id, subflow_id);
";

/// Default database file, relative to the working directory
pub const DEFAULT_DB_PATH: &str = "performance_log.db";

/// Subflow row as stored in `subflows`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubflow {
    pub subflow_id: SubflowId,
    pub local_addr: String,
    pub remote_addr: String,
}

/// Opens [`SqliteStore`] handles on a database file
#[derive(Debug, Clone)]
pub struct SqliteStoreFactory {
    path: PathBuf,
    delete_on_exit: bool,
}

impl SqliteStoreFactory {
    /// Create a factory for the given database file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delete_on_exit: false,
        }
    }

    /// Remove the database file when the store is closed
    pub fn delete_on_exit(mut self, delete: bool) -> Self {
        self.delete_on_exit = delete;
        self
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self) -> Result<Box<dyn SampleStore>> {
        let store = SqliteStore::open(&self.path)?;
        Ok(Box::new(SqliteStore {
            delete_on_exit: self.delete_on_exit,
            ..store
        }))
    }
}

/// SQLite sample store; one connection, used from a single thread
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    delete_on_exit: bool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("delete_on_exit", &self.delete_on_exit)
            .finish()
    }
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let _span = info_span!("sqlite_store_open", path = %path.display()).entered();

        let conn = Connection::open(path).map_err(|e| PerflogError::persistence("open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| PerflogError::persistence("open", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| PerflogError::persistence("create_schema", e))?;

        debug!("Opened sample store");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            delete_on_exit: false,
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| PerflogError::persistence("open", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| PerflogError::persistence("create_schema", e))?;
        Ok(Self {
            conn,
            path: None,
            delete_on_exit: false,
        })
    }

    /// Subflows registered for an iteration, ordered by subflow id
    pub fn subflows(&self, iteration_id: &str) -> Result<Vec<StoredSubflow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT subflow_id, local_addr, remote_addr FROM subflows \
                 WHERE iteration_id = ?1 ORDER BY subflow_id",
            )
            .map_err(|e| PerflogError::persistence("query_subflows", e))?;
        let rows = stmt
            .query_map(params![iteration_id], |row| {
                Ok(StoredSubflow {
                    subflow_id: row.get(0)?,
                    local_addr: row.get(1)?,
                    remote_addr: row.get(2)?,
                })
            })
            .map_err(|e| PerflogError::persistence("query_subflows", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PerflogError::persistence("query_subflows", e))
    }

    /// Samples recorded for an iteration, in insertion order
    pub fn samples(&self, iteration_id: &str) -> Result<Vec<(SubflowId, FeatureMap)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT subflow_id, features FROM subflow_tcp_conn_info \
                 WHERE iteration_id = ?1 ORDER BY rowid",
            )
            .map_err(|e| PerflogError::persistence("query_samples", e))?;
        let rows = stmt
            .query_map(params![iteration_id], |row| {
                Ok((row.get::<_, SubflowId>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| PerflogError::persistence("query_samples", e))?;

        let mut samples = Vec::new();
        for row in rows {
            let (subflow_id, json) =
                row.map_err(|e| PerflogError::persistence("query_samples", e))?;
            let features: FeatureMap = serde_json::from_str(&json)
                .map_err(|e| PerflogError::persistence("decode_sample", e))?;
            samples.push((subflow_id, features));
        }
        Ok(samples)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SampleStore for SqliteStore {
    fn register_subflow(
        &mut self,
        iteration_id: &str,
        subflow_id: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO subflows \
                 (iteration_id, subflow_id, local_addr, remote_addr, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    iteration_id,
                    subflow_id,
                    local.to_string(),
                    remote.to_string(),
                    now_rfc3339(),
                ],
            )
            .map_err(|e| PerflogError::persistence("register_subflow", e))?;
        Ok(())
    }

    fn record_sample(
        &mut self,
        iteration_id: &str,
        subflow_id: SubflowId,
        features: &FeatureMap,
    ) -> Result<()> {
        let json = serde_json::to_string(features)
            .map_err(|e| PerflogError::persistence("encode_sample", e))?;
        self.conn
            .execute(
                "INSERT INTO subflow_tcp_conn_info \
                 (iteration_id, subflow_id, recorded_at, features) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![iteration_id, subflow_id, now_rfc3339(), json],
            )
            .map_err(|e| PerflogError::persistence("record_sample", e))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let SqliteStore {
            conn,
            path,
            delete_on_exit,
        } = *self;

        conn.close()
            .map_err(|(_, e)| PerflogError::persistence("close", e))?;

        if let (true, Some(path)) = (delete_on_exit, path) {
            info!(path = %path.display(), "Deleting sample database on exit");
            for suffix in ["", "-wal", "-shm"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(error = %e, "Failed to delete database file"),
                }
            }
        }
        Ok(())
    }
}
