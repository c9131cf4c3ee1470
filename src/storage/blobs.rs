//! Blob store
//!
//! Paths canonicalize like VFS paths; each blob is addressed by its sha256.
//! Overwriting a path replaces metadata and content together.

use sha2::{Digest, Sha256};

use super::Scope;
use crate::store::Store;
use crate::types::Result;
use crate::vfs::canonical_path;

/// Blob metadata for listings
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlobMeta {
    pub path: String,
    pub mime_type: String,
    pub size: u64,
    pub sha256: String,
}

pub struct Blobs<'a> {
    store: &'a Store,
    scope: &'a Scope,
}

impl<'a> Blobs<'a> {
    pub fn new(store: &'a Store, scope: &'a Scope) -> Self {
        Self { store, scope }
    }

    pub async fn put(&self, path: &str, data: Vec<u8>, mime: &str) -> Result<String> {
        let path = canonical_path(path)?;
        let sha = hex::encode(Sha256::digest(&data));
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let mime = mime.to_string();
        let p = path.clone();
        let sha_out = sha.clone();

        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO app_blobs (app_id, user_id, path, content, mime_type, sha256)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (app_id, user_id, path) DO UPDATE SET
                       content = excluded.content,
                       mime_type = excluded.mime_type,
                       sha256 = excluded.sha256",
                    rusqlite::params![app, user, p, data, mime, sha],
                )?;
                Ok(())
            })
            .await?;
        Ok(sha_out)
    }

    pub async fn get(&self, path: &str) -> Result<Option<(Vec<u8>, String)>> {
        let path = canonical_path(path)?;
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT content, mime_type FROM app_blobs
                     WHERE app_id = ?1 AND user_id = ?2 AND path = ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![app, user, path])?;
                match rows.next()? {
                    Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = canonical_path(path)?;
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "DELETE FROM app_blobs WHERE app_id = ?1 AND user_id = ?2 AND path = ?3",
                    rusqlite::params![app, user, path],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let prefix = canonical_path(prefix)?;
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        self.store
            .read(move |conn| {
                let like = format!("{}%", prefix.trim_end_matches('/'));
                let mut stmt = conn.prepare_cached(
                    "SELECT path, mime_type, LENGTH(content), sha256 FROM app_blobs
                     WHERE app_id = ?1 AND user_id = ?2 AND path LIKE ?3 ORDER BY path",
                )?;
                let rows = stmt.query_map(rusqlite::params![app, user, like], |r| {
                    Ok(BlobMeta {
                        path: r.get(0)?,
                        mime_type: r.get(1)?,
                        size: r.get::<_, i64>(2)? as u64,
                        sha256: r.get(3)?,
                    })
                })?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AppStorage;

    async fn temp_blobs() -> (AppStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("blobs.db")).unwrap();
        (AppStorage::new(store, Scope::app("app_1")), dir)
    }

    #[tokio::test]
    async fn put_get_preserves_bytes_and_mime() {
        let (storage, _dir) = temp_blobs().await;
        let blobs = storage.blobs();
        blobs.put("/img/a.png", vec![1, 2, 3], "image/png").await.unwrap();
        let (data, mime) = blobs.get("/img/a.png").await.unwrap().unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn sha_matches_content() {
        let (storage, _dir) = temp_blobs().await;
        let blobs = storage.blobs();
        let sha = blobs.put("/x", b"hello".to_vec(), "text/plain").await.unwrap();
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let listing = blobs.list("/").await.unwrap();
        assert_eq!(listing[0].sha256, sha);
        assert_eq!(listing[0].size, 5);
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let (storage, _dir) = temp_blobs().await;
        let blobs = storage.blobs();
        blobs.put("/f", b"v1".to_vec(), "text/plain").await.unwrap();
        blobs.put("/f", b"v2".to_vec(), "application/json").await.unwrap();
        let (data, mime) = blobs.get("/f").await.unwrap().unwrap();
        assert_eq!(data, b"v2");
        assert_eq!(mime, "application/json");
    }

    #[tokio::test]
    async fn traversal_rejected() {
        let (storage, _dir) = temp_blobs().await;
        assert!(storage.blobs().get("../other").await.is_err());
    }
}
