//! Virtual file system
//!
//! The (app_id, path) -> bytes projection stored in the database, fronted by
//! a byte-budgeted LRU cache. Serving composes the static policy: trailing
//! slash canonicalization, ETag/conditional gets, SPA fallback, and the
//! universal 404 app.

pub mod cache;

pub use cache::{CacheStats, CachedFile, FileCache};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::Store;
use crate::types::{FaztError, Result};

/// Metadata row for listings
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileMeta {
    pub path: String,
    pub mime_type: String,
    pub size: u64,
    pub sha256: String,
    pub updated_at: String,
}

/// Canonicalize a VFS path: forward slashes, a single leading slash, no
/// empty or dot segments, and no parent traversal.
pub fn canonical_path(raw: &str) -> Result<String> {
    let raw = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(FaztError::Validation("path traversal not allowed".into())),
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Guess a mime type from the path extension
pub fn mime_for_path(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Cache-Control policy derived from content type: HTML revalidates every
/// time (deploys must show up immediately), hashed-name assets get a day.
fn cache_control(mime: &str) -> &'static str {
    if mime.starts_with("text/html") {
        "no-cache"
    } else if mime.starts_with("image/")
        || mime.starts_with("font/")
        || mime == "text/css"
        || mime == "application/javascript"
        || mime == "text/javascript"
    {
        "public, max-age=86400"
    } else {
        "public, max-age=300"
    }
}

/// File storage and serving for all apps
pub struct Vfs {
    store: Store,
    cache: FileCache,
}

impl Vfs {
    pub fn new(store: Store, cache_budget_bytes: usize) -> Self {
        Self {
            store,
            cache: FileCache::new(cache_budget_bytes),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fetch a file, consulting the cache first
    pub async fn get(&self, app_id: &str, path: &str) -> Result<Option<CachedFile>> {
        let path = canonical_path(path)?;
        if let Some(hit) = self.cache.get(app_id, &path) {
            return Ok(Some(hit));
        }

        let app = app_id.to_string();
        let p = path.clone();
        let row = self
            .store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT content, mime_type, sha256 FROM files WHERE app_id = ?1 AND path = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![app, p])?;
                match rows.next()? {
                    Some(row) => {
                        let content: Vec<u8> = row.get(0)?;
                        let mime: String = row.get(1)?;
                        let sha: String = row.get(2)?;
                        Ok(Some((content, mime, sha)))
                    }
                    None => Ok(None),
                }
            })
            .await?;

        Ok(row.map(|(content, mime, sha)| {
            let file = CachedFile {
                bytes: Bytes::from(content),
                mime,
                etag: sha,
            };
            self.cache.insert(app_id, &path, file.clone());
            file
        }))
    }

    /// List file metadata under a prefix
    pub async fn list(&self, app_id: &str, prefix: &str) -> Result<Vec<FileMeta>> {
        let prefix = canonical_path(prefix)?;
        let app = app_id.to_string();
        self.store
            .read(move |conn| {
                let like = format!("{}%", prefix.trim_end_matches('/'));
                let mut stmt = conn.prepare_cached(
                    "SELECT path, mime_type, size, sha256, updated_at FROM files
                     WHERE app_id = ?1 AND path LIKE ?2 ORDER BY path",
                )?;
                let rows = stmt.query_map(rusqlite::params![app, like], |r| {
                    Ok(FileMeta {
                        path: r.get(0)?,
                        mime_type: r.get(1)?,
                        size: r.get::<_, i64>(2)? as u64,
                        sha256: r.get(3)?,
                        updated_at: r.get(4)?,
                    })
                })?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Create or replace a file. Control-plane only; the cache entry is
    /// dropped only after the write has committed.
    pub async fn put(&self, app_id: &str, path: &str, bytes: Vec<u8>, mime: &str) -> Result<()> {
        let path = canonical_path(path)?;
        let sha = hex::encode(Sha256::digest(&bytes));
        let app = app_id.to_string();
        let p = path.clone();
        let mime = mime.to_string();
        let now = Utc::now().to_rfc3339();
        let size = bytes.len() as i64;

        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO files (app_id, path, mime_type, size, content, sha256, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (app_id, path) DO UPDATE SET
                       mime_type = excluded.mime_type,
                       size = excluded.size,
                       content = excluded.content,
                       sha256 = excluded.sha256,
                       updated_at = excluded.updated_at",
                    rusqlite::params![app, p, mime, size, bytes, sha, now],
                )?;
                Ok(())
            })
            .await?;

        self.cache.invalidate(app_id, &path);
        Ok(())
    }

    /// Remove a file; removing a missing path is not an error
    pub async fn delete(&self, app_id: &str, path: &str) -> Result<bool> {
        let path = canonical_path(path)?;
        let app = app_id.to_string();
        let p = path.clone();
        let deleted = self
            .store
            .writes()
            .submit(move |tx| {
                let n = tx.execute(
                    "DELETE FROM files WHERE app_id = ?1 AND path = ?2",
                    rusqlite::params![app, p],
                )?;
                Ok(n > 0)
            })
            .await?;
        self.cache.invalidate(app_id, &path);
        Ok(deleted)
    }

    /// Drop every file belonging to an app and clear its cache entries
    pub async fn delete_app(&self, app_id: &str) -> Result<()> {
        let app = app_id.to_string();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute("DELETE FROM files WHERE app_id = ?1", [app])?;
                Ok(())
            })
            .await?;
        self.cache.invalidate_app(app_id);
        Ok(())
    }

    /// Serve a static path for an app, composing the full policy:
    /// (a) non-root trailing slash: 301 to the trimmed path;
    /// (b) file exists: stream with derived Cache-Control and sha256 ETag,
    ///     honoring If-None-Match;
    /// (c) SPA enabled and path has no extension: the app's index.html, 200;
    /// (d) 404, via the universal-404 app when one is configured.
    pub async fn serve(
        &self,
        app_id: &str,
        path: &str,
        spa: bool,
        if_none_match: Option<&str>,
        universal_404: Option<&str>,
    ) -> Result<Response<Full<Bytes>>> {
        if path.len() > 1 && path.ends_with('/') {
            let trimmed = path.trim_end_matches('/');
            return Ok(Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header("Location", trimmed)
                .body(Full::new(Bytes::new()))
                .unwrap());
        }

        // The site root maps onto the app's index page
        let lookup = if path == "/" || path.is_empty() {
            "/index.html"
        } else {
            path
        };
        if let Some(file) = self.get(app_id, lookup).await? {
            return Ok(file_response(&file, if_none_match));
        }

        let has_extension = path
            .rsplit('/')
            .next()
            .is_some_and(|seg| seg.contains('.'));
        if spa && !has_extension {
            if let Some(index) = self.get(app_id, "/index.html").await? {
                debug!(app_id, path, "SPA fallback to index.html");
                return Ok(file_response(&index, None));
            }
        }

        self.not_found(universal_404).await
    }

    /// 404 body: the universal-404 app's page when configured, plain otherwise
    pub async fn not_found(
        &self,
        universal_404: Option<&str>,
    ) -> Result<Response<Full<Bytes>>> {
        if let Some(app_404) = universal_404 {
            for candidate in ["/404.html", "/index.html"] {
                if let Some(file) = self.get(app_404, candidate).await? {
                    return Ok(Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .header("Content-Type", file.mime.as_str())
                        .body(Full::new(file.bytes))
                        .unwrap());
                }
            }
        }
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap())
    }
}

fn file_response(file: &CachedFile, if_none_match: Option<&str>) -> Response<Full<Bytes>> {
    let etag = format!("\"{}\"", file.etag);
    if let Some(inm) = if_none_match {
        if inm.trim_matches('"') == file.etag {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header("ETag", etag)
                .body(Full::new(Bytes::new()))
                .unwrap();
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", file.mime.as_str())
        .header("Cache-Control", cache_control(&file.mime))
        .header("ETag", etag)
        .body(Full::new(file.bytes.clone()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn temp_vfs() -> (Arc<Vfs>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("vfs.db")).unwrap();
        (Arc::new(Vfs::new(store, 1024 * 1024)), dir)
    }

    #[test]
    fn paths_canonicalize() {
        assert_eq!(canonical_path("foo/bar.js").unwrap(), "/foo/bar.js");
        assert_eq!(canonical_path("//a///b/").unwrap(), "/a/b");
        assert_eq!(canonical_path("./x").unwrap(), "/x");
        assert!(canonical_path("../etc/passwd").is_err());
        assert!(canonical_path("/a/../b").is_err());
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (vfs, _dir) = temp_vfs().await;
        vfs.put("app_1", "/app.js", b"x=1".to_vec(), "application/javascript")
            .await
            .unwrap();
        let file = vfs.get("app_1", "/app.js").await.unwrap().unwrap();
        assert_eq!(&file.bytes[..], b"x=1");
        assert_eq!(file.mime, "application/javascript");
    }

    #[tokio::test]
    async fn spa_fallback_serves_index() {
        let (vfs, _dir) = temp_vfs().await;
        vfs.put("app_1", "/index.html", b"<html>".to_vec(), "text/html")
            .await
            .unwrap();

        let resp = vfs
            .serve("app_1", "/dashboard", true, None, None)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Extension paths never fall back
        let resp = vfs
            .serve("app_1", "/missing.css", true, None, None)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trailing_slash_redirects() {
        let (vfs, _dir) = temp_vfs().await;
        let resp = vfs
            .serve("app_1", "/docs/", false, None, None)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()["Location"], "/docs");
    }

    #[tokio::test]
    async fn conditional_get_returns_304() {
        let (vfs, _dir) = temp_vfs().await;
        vfs.put("app_1", "/a.txt", b"hello".to_vec(), "text/plain")
            .await
            .unwrap();
        let file = vfs.get("app_1", "/a.txt").await.unwrap().unwrap();

        let resp = vfs
            .serve("app_1", "/a.txt", false, Some(file.etag.as_str()), None)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn stale_reads_impossible_after_put() {
        let (vfs, _dir) = temp_vfs().await;
        vfs.put("app_1", "/f", b"v1".to_vec(), "text/plain")
            .await
            .unwrap();
        let _ = vfs.get("app_1", "/f").await.unwrap(); // warm cache
        vfs.put("app_1", "/f", b"v2".to_vec(), "text/plain")
            .await
            .unwrap();
        let file = vfs.get("app_1", "/f").await.unwrap().unwrap();
        assert_eq!(&file.bytes[..], b"v2");
    }
}
