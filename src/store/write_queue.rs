//! Process-wide single writer
//!
//! All mutating database work funnels through one dedicated thread owning
//! one connection. This is the only code path that opens IMMEDIATE
//! transactions; readers stay on deferred read transactions. Tasks retry on
//! transient busy errors with exponential backoff before surfacing
//! `StorageBusy` to the caller.

use rusqlite::{Connection, TransactionBehavior};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::types::{FaztError, Result};

/// Initial retry backoff on SQLITE_BUSY
const RETRY_INITIAL: Duration = Duration::from_millis(20);
/// Backoff cap
const RETRY_CAP: Duration = Duration::from_millis(320);
/// Attempts before giving up
const RETRY_MAX_ATTEMPTS: u32 = 5;

/// A unit of write work executed on the writer thread
type WriteTask = Box<dyn FnOnce(&mut Connection) + Send>;

/// Handle for submitting write tasks
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteTask>,
}

impl WriteQueue {
    /// Spawn the writer thread around an exclusive connection
    pub fn start(conn: Connection) -> Self {
        let (tx, rx) = mpsc::channel::<WriteTask>();

        std::thread::Builder::new()
            .name("fazt-writer".into())
            .spawn(move || writer_loop(conn, rx))
            .expect("failed to spawn writer thread");

        Self { tx }
    }

    /// Run `f` inside an IMMEDIATE transaction on the writer thread.
    ///
    /// Suspends the caller until the write commits or retries are exhausted.
    /// A non-transient error rolls back and is returned as-is.
    pub async fn submit<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();

        let task: WriteTask = Box::new(move |conn: &mut Connection| {
            let result = run_with_retry(conn, f);
            let _ = reply_tx.send(result);
        });

        self.tx
            .send(task)
            .map_err(|_| FaztError::Internal("write queue closed".into()))?;

        reply_rx
            .await
            .map_err(|_| FaztError::Internal("writer dropped reply".into()))?
            .map_err(Into::into)
    }
}

/// Retry loop: IMMEDIATE begin, run, commit; back off on busy.
fn run_with_retry<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&rusqlite::Transaction) -> Result<T>,
{
    let mut f = Some(f);
    let mut backoff = RETRY_INITIAL;

    for attempt in 1..=RETRY_MAX_ATTEMPTS {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) => {
                debug!("write begin busy (attempt {attempt}), backing off {backoff:?}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(RETRY_CAP);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        // The closure is consumed on the attempt that reaches it; begin-time
        // busy retries above never consume it.
        let func = f.take().expect("write task ran twice");
        match func(&tx) {
            Ok(value) => match tx.commit() {
                Ok(()) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    warn!("commit busy after task ran; surfacing as storage busy");
                    return Err(FaztError::StorageBusy(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            },
            Err(e) => {
                // Rollback happens on Transaction drop
                return Err(e);
            }
        }
    }

    Err(FaztError::StorageBusy(format!(
        "write retries exhausted after {RETRY_MAX_ATTEMPTS} attempts"
    )))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn writer_loop(mut conn: Connection, rx: mpsc::Receiver<WriteTask>) {
    debug!("writer thread started");
    while let Ok(task) = rx.recv() {
        task(&mut conn);
    }
    error!("writer thread exiting: all senders dropped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations;

    async fn queue_with_schema() -> (WriteQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wq.db");
        let mut conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "journal_mode", "WAL").unwrap();
        migrations::run(&mut conn).unwrap();
        (WriteQueue::start(conn), dir)
    }

    #[tokio::test]
    async fn writes_are_applied_in_submission_order() {
        let (queue, _dir) = queue_with_schema().await;

        queue
            .submit(|tx| {
                tx.execute(
                    "INSERT INTO app_kv (app_id, user_id, key, value) VALUES ('a', '', 'k', ?1)",
                    [b"one".as_slice()],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        queue
            .submit(|tx| {
                tx.execute(
                    "UPDATE app_kv SET value = ?1 WHERE app_id = 'a' AND key = 'k'",
                    [b"two".as_slice()],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let value: Vec<u8> = queue
            .submit(|tx| {
                Ok(tx.query_row(
                    "SELECT value FROM app_kv WHERE app_id = 'a' AND key = 'k'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(value, b"two");
    }

    #[tokio::test]
    async fn task_error_rolls_back() {
        let (queue, _dir) = queue_with_schema().await;

        let result: Result<()> = queue
            .submit(|tx| {
                tx.execute(
                    "INSERT INTO app_kv (app_id, user_id, key, value) VALUES ('a', '', 'k', x'00')",
                    [],
                )?;
                Err(FaztError::Validation("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = queue
            .submit(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM app_kv", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
