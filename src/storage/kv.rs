//! Key-value store with TTL
//!
//! Values are opaque bytes; the script binding serializes strings and JSON
//! documents before they arrive here. Expiry is absolute at write time.
//! Reads filter expired rows; a background sweeper removes them lazily.

use chrono::{Duration, Utc};

use super::Scope;
use crate::store::Store;
use crate::types::Result;

pub struct Kv<'a> {
    store: &'a Store,
    scope: &'a Scope,
}

impl<'a> Kv<'a> {
    pub fn new(store: &'a Store, scope: &'a Scope) -> Self {
        Self { store, scope }
    }

    /// Write a value, optionally expiring `ttl_ms` from now
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<()> {
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let key = key.to_string();
        let expires_at = ttl_ms
            .map(|ms| (Utc::now() + Duration::milliseconds(ms as i64)).to_rfc3339());

        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO app_kv (app_id, user_id, key, value, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (app_id, user_id, key) DO UPDATE SET
                       value = excluded.value,
                       expires_at = excluded.expires_at",
                    rusqlite::params![app, user, key, value, expires_at],
                )?;
                Ok(())
            })
            .await
    }

    /// Read a value; expired entries are invisible
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let key = key.to_string();
        let now = Utc::now().to_rfc3339();

        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT value FROM app_kv
                     WHERE app_id = ?1 AND user_id = ?2 AND key = ?3
                       AND (expires_at IS NULL OR expires_at >= ?4)",
                )?;
                let mut rows = stmt.query(rusqlite::params![app, user, key, now])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Delete a key. Deleting a missing key is a no-op, not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let key = key.to_string();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "DELETE FROM app_kv WHERE app_id = ?1 AND user_id = ?2 AND key = ?3",
                    rusqlite::params![app, user, key],
                )?;
                Ok(())
            })
            .await
    }

    /// List live keys under a prefix, sorted
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let now = Utc::now().to_rfc3339();

        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT key FROM app_kv
                     WHERE app_id = ?1 AND user_id = ?2 AND key LIKE ?3 ESCAPE '\\'
                       AND (expires_at IS NULL OR expires_at >= ?4)
                     ORDER BY key",
                )?;
                let rows = stmt.query_map(rusqlite::params![app, user, like, now], |r| r.get(0))?;
                Ok(rows.collect::<std::result::Result<Vec<String>, _>>()?)
            })
            .await
    }
}

/// Remove expired rows across all apps. Driven by a periodic task; get/list
/// already filter, so this only reclaims space.
pub async fn sweep_expired(store: &Store) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    store
        .writes()
        .submit(move |tx| {
            let n = tx.execute(
                "DELETE FROM app_kv WHERE expires_at IS NOT NULL AND expires_at < ?1",
                [now],
            )?;
            Ok(n)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AppStorage;

    async fn temp_kv() -> (AppStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("kv.db")).unwrap();
        (AppStorage::new(store, Scope::app("app_1")), dir)
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let (storage, _dir) = temp_kv().await;
        let kv = storage.kv();
        kv.set("greeting", b"hello".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("greeting").await.unwrap().unwrap(), b"hello");

        kv.delete("greeting").await.unwrap();
        assert!(kv.get("greeting").await.unwrap().is_none());
        // Second delete is a no-op
        kv.delete("greeting").await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_invisible() {
        let (storage, _dir) = temp_kv().await;
        let kv = storage.kv();
        kv.set("gone", b"x".to_vec(), Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(kv.get("gone").await.unwrap().is_none());
        assert!(kv.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_honors_prefix() {
        let (storage, _dir) = temp_kv().await;
        let kv = storage.kv();
        kv.set("user:1", b"a".to_vec(), None).await.unwrap();
        kv.set("user:2", b"b".to_vec(), None).await.unwrap();
        kv.set("item:1", b"c".to_vec(), None).await.unwrap();
        assert_eq!(kv.list("user:").await.unwrap(), vec!["user:1", "user:2"]);
    }

    #[tokio::test]
    async fn user_scope_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("kv.db")).unwrap();
        let alice = AppStorage::new(store.clone(), Scope::user("app_1", "usr_a"));
        let bob = AppStorage::new(store.clone(), Scope::user("app_1", "usr_b"));
        let app = AppStorage::new(store, Scope::app("app_1"));

        alice.kv().set("k", b"alice".to_vec(), None).await.unwrap();
        assert!(bob.kv().get("k").await.unwrap().is_none());
        assert!(app.kv().get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweeper_reclaims_expired_rows() {
        let (storage, _dir) = temp_kv().await;
        let kv = storage.kv();
        kv.set("dead", b"x".to_vec(), Some(0)).await.unwrap();
        kv.set("live", b"y".to_vec(), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let swept = sweep_expired(storage_store(&storage)).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(kv.get("live").await.unwrap().unwrap(), b"y");
    }

    fn storage_store(storage: &AppStorage) -> &Store {
        // Test-only accessor; production code goes through AppStorage.
        &storage.store
    }
}
