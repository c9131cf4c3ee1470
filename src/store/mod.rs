//! Embedded relational store
//!
//! One SQLite file in WAL mode holds everything the process persists. The
//! Store owns schema and migrations, hands out a pooled read path, and
//! funnels every mutation through the process-wide [`WriteQueue`].

pub mod migrations;
pub mod write_queue;

pub use write_queue::WriteQueue;

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::types::{FaztError, Result};

/// Read connections kept open for concurrent queries
const READ_POOL_SIZE: usize = 10;

/// Busy timeout applied to every connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Handle on the database: pooled readers plus the single write path
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    readers: Arc<ReadPool>,
    write_queue: WriteQueue,
}

impl Store {
    /// Open (creating if needed) the database, run migrations, start the
    /// writer thread and the read pool. Migration failure is fatal to the
    /// caller by contract.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut writer = Connection::open(path)?;
        apply_pragmas(&writer)?;
        migrations::run(&mut writer)?;
        let version = migrations::version(&writer)?;

        let mut conns = Vec::with_capacity(READ_POOL_SIZE);
        for _ in 0..READ_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
            conns.push(conn);
        }

        info!(
            path = %path.display(),
            schema_version = version,
            readers = READ_POOL_SIZE,
            "Store opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            readers: Arc::new(ReadPool::new(conns)),
            write_queue: WriteQueue::start(writer),
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The single mutation capability
    pub fn writes(&self) -> &WriteQueue {
        &self.write_queue
    }

    /// Run a read-only query on a pooled connection.
    ///
    /// Reads use deferred transactions implicitly; they are never permitted
    /// to mutate (connections are opened read-only).
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.readers.run(f).await
    }

    /// Current schema version, for the system info endpoint
    pub async fn schema_version(&self) -> Result<i64> {
        self.read(|conn| migrations::version(conn)).await
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Fixed-size pool of read-only connections
struct ReadPool {
    conns: Mutex<Vec<Connection>>,
    permits: Semaphore,
}

impl ReadPool {
    fn new(conns: Vec<Connection>) -> Self {
        let permits = Semaphore::new(conns.len());
        Self {
            conns: Mutex::new(conns),
            permits,
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FaztError::Internal("read pool closed".into()))?;

        let conn = {
            let mut conns = self.conns.lock().await;
            conns.pop().expect("permit held but pool empty")
        };

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| FaztError::Internal(format!("read task panicked: {e}")))?;

        self.conns.lock().await.push(conn);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn open_runs_migrations() {
        let (store, _dir) = temp_store().await;
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reads_observe_acknowledged_writes() {
        let (store, _dir) = temp_store().await;

        store
            .writes()
            .submit(|tx| {
                tx.execute(
                    "INSERT INTO apps (id, name, manifest, created_at, updated_at)
                     VALUES ('app_000000000001', 'demo', '{}', '2026-01-01', '2026-01-01')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let name: String = store
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT name FROM apps WHERE id = 'app_000000000001'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(name, "demo");
    }

    #[tokio::test]
    async fn read_connections_cannot_mutate() {
        let (store, _dir) = temp_store().await;
        let result = store
            .read(|conn| {
                conn.execute("DELETE FROM apps", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }
}
