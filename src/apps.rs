//! App registry
//!
//! CRUD over the apps table plus zip bundle deployment into the VFS. The
//! control plane is the only writer; the request pipeline reads.

use chrono::Utc;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;

use crate::ids;
use crate::manifest::Manifest;
use crate::store::Store;
use crate::types::{FaztError, Result};
use crate::vfs::Vfs;

/// One app row with its parsed manifest
#[derive(Debug, Clone)]
pub struct App {
    pub id: String,
    pub name: String,
    pub manifest: Value,
    pub manifest_parsed: Manifest,
    pub original_id: Option<String>,
    pub forked_from_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl App {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "manifest": self.manifest,
            "original_id": self.original_id,
            "forked_from_id": self.forked_from_id,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }
}

fn row_to_app(r: &rusqlite::Row<'_>) -> Result<App> {
    let manifest: Value = serde_json::from_str(&r.get::<_, String>(2)?)?;
    Ok(App {
        id: r.get(0)?,
        name: r.get(1)?,
        manifest_parsed: Manifest::parse(&manifest)?,
        manifest,
        original_id: r.get(3)?,
        forked_from_id: r.get(4)?,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
    })
}

const APP_COLUMNS: &str =
    "id, name, manifest, original_id, forked_from_id, created_at, updated_at";

/// Fetch one app
pub async fn get(store: &Store, app_id: &str) -> Result<Option<App>> {
    let id = app_id.to_string();
    store
        .read(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {APP_COLUMNS} FROM apps WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(r) => Ok(Some(row_to_app(r)?)),
                None => Ok(None),
            }
        })
        .await
}

/// All apps, by creation time
pub async fn list(store: &Store) -> Result<Vec<App>> {
    store
        .read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {APP_COLUMNS} FROM apps ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], |r| {
                row_to_app(r).map_err(|e| {
                    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(
                        e.to_string(),
                    )))
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
}

/// Create an app from a manifest value. The id is assigned here and is
/// immutable for the app's lifetime.
pub async fn create(store: &Store, manifest: &Value) -> Result<App> {
    let parsed = Manifest::parse(manifest)?;
    let id = ids::app_id();
    let now = Utc::now().to_rfc3339();
    let app = App {
        id: id.clone(),
        name: parsed.name.clone(),
        manifest: manifest.clone(),
        manifest_parsed: parsed,
        original_id: None,
        forked_from_id: None,
        created_at: now.clone(),
        updated_at: now.clone(),
    };

    let manifest_json = manifest.to_string();
    let name = app.name.clone();
    store
        .writes()
        .submit(move |tx| {
            tx.execute(
                "INSERT INTO apps (id, name, manifest, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, name, manifest_json, now, now],
            )?;
            Ok(())
        })
        .await?;
    Ok(app)
}

/// Fork an app: new id, copied manifest and files, lineage recorded
pub async fn fork(store: &Store, vfs: &Arc<Vfs>, source_app_id: &str) -> Result<App> {
    let source = get(store, source_app_id)
        .await?
        .ok_or_else(|| FaztError::NotFound(format!("app {source_app_id}")))?;

    let id = ids::app_id();
    let now = Utc::now().to_rfc3339();
    let original = source
        .original_id
        .clone()
        .unwrap_or_else(|| source.id.clone());

    let manifest_json = source.manifest.to_string();
    let name = source.name.clone();
    let new_id = id.clone();
    let orig = original.clone();
    let forked_from = source.id.clone();
    let created = now.clone();
    store
        .writes()
        .submit(move |tx| {
            tx.execute(
                "INSERT INTO apps (id, name, manifest, original_id, forked_from_id,
                                   created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![new_id, name, manifest_json, orig, forked_from, created],
            )?;
            // Copy the file tree inside the same transaction
            tx.execute(
                "INSERT INTO files (app_id, path, mime_type, size, content, sha256, updated_at)
                 SELECT ?1, path, mime_type, size, content, sha256, ?2
                 FROM files WHERE app_id = ?3",
                rusqlite::params![new_id, created, forked_from],
            )?;
            Ok(())
        })
        .await?;

    let _ = vfs; // forked files are fresh rows; no cache entries exist yet

    Ok(App {
        id,
        name: source.name,
        manifest_parsed: source.manifest_parsed,
        manifest: source.manifest,
        original_id: Some(original),
        forked_from_id: Some(source.id),
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Replace the manifest of an existing app
pub async fn update_manifest(store: &Store, app_id: &str, manifest: &Value) -> Result<App> {
    Manifest::parse(manifest)?;
    let id = app_id.to_string();
    let manifest_json = manifest.to_string();
    let now = Utc::now().to_rfc3339();
    let name = Manifest::parse(manifest)?.name;
    store
        .writes()
        .submit(move |tx| {
            let n = tx.execute(
                "UPDATE apps SET manifest = ?2, name = ?3, updated_at = ?4 WHERE id = ?1",
                rusqlite::params![id, manifest_json, name, now],
            )?;
            if n == 0 {
                return Err(FaztError::NotFound(format!("app {id}")));
            }
            Ok(())
        })
        .await?;
    get(store, app_id)
        .await?
        .ok_or_else(|| FaztError::NotFound(format!("app {app_id}")))
}

/// Delete an app row. Files, storage rows, and jobs are the caller's
/// responsibility (they hold the VFS/worker handles needed for cleanup).
pub async fn delete(store: &Store, app_id: &str) -> Result<bool> {
    let id = app_id.to_string();
    store
        .writes()
        .submit(move |tx| {
            let n = tx.execute("DELETE FROM apps WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
        .await
}

/// Deploy a zip bundle into an app's VFS. Every regular file lands at its
/// archive path; directories and anything escaping the root are skipped.
pub async fn deploy_zip(vfs: &Arc<Vfs>, app_id: &str, bundle: Vec<u8>) -> Result<usize> {
    let entries = tokio::task::spawn_blocking(move || -> Result<Vec<(String, Vec<u8>)>> {
        let reader = std::io::Cursor::new(bundle);
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|e| FaztError::Validation(format!("invalid zip bundle: {e}")))?;
        let mut entries = Vec::new();
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| FaztError::Validation(format!("zip entry {i}: {e}")))?;
            if !file.is_file() {
                continue;
            }
            let Some(path) = file.enclosed_name() else {
                continue; // entry escapes the root
            };
            let path = format!("/{}", path.to_string_lossy());
            let mut content = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut content)
                .map_err(|e| FaztError::Validation(format!("zip entry {path}: {e}")))?;
            entries.push((path, content));
        }
        Ok(entries)
    })
    .await
    .map_err(|e| FaztError::Internal(format!("zip extraction task: {e}")))??;

    let count = entries.len();
    for (path, content) in entries {
        let mime = crate::vfs::mime_for_path(&path);
        vfs.put(app_id, &path, content, &mime).await?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    async fn temp() -> (Store, Arc<Vfs>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("apps.db")).unwrap();
        let vfs = Arc::new(Vfs::new(store.clone(), 1024 * 1024));
        (store, vfs, dir)
    }

    #[tokio::test]
    async fn create_get_delete() {
        let (store, _vfs, _dir) = temp().await;
        let app = create(&store, &json!({"name": "blog", "spa": true}))
            .await
            .unwrap();
        assert!(app.id.starts_with("app_"));
        assert!(app.manifest_parsed.spa);

        let fetched = get(&store, &app.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "blog");

        assert!(delete(&store, &app.id).await.unwrap());
        assert!(get(&store, &app.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fork_records_lineage_and_copies_files() {
        let (store, vfs, _dir) = temp().await;
        let app = create(&store, &json!({"name": "orig"})).await.unwrap();
        vfs.put(&app.id, "/index.html", b"<html>".to_vec(), "text/html")
            .await
            .unwrap();

        let forked = fork(&store, &vfs, &app.id).await.unwrap();
        assert_eq!(forked.forked_from_id.as_deref(), Some(app.id.as_str()));
        assert_eq!(forked.original_id.as_deref(), Some(app.id.as_str()));

        let file = vfs.get(&forked.id, "/index.html").await.unwrap().unwrap();
        assert_eq!(&file.bytes[..], b"<html>");

        // Forking a fork keeps the original root
        let again = fork(&store, &vfs, &forked.id).await.unwrap();
        assert_eq!(again.original_id.as_deref(), Some(app.id.as_str()));
    }

    #[tokio::test]
    async fn zip_deploy_lands_files() {
        let (store, vfs, _dir) = temp().await;
        let app = create(&store, &json!({"name": "bundle"})).await.unwrap();

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("index.html", options).unwrap();
            writer.write_all(b"<html>").unwrap();
            writer.start_file("api/main.rhai", options).unwrap();
            writer.write_all(b"respond(200);").unwrap();
            writer.finish().unwrap();
        }

        let count = deploy_zip(&vfs, &app.id, cursor.into_inner()).await.unwrap();
        assert_eq!(count, 2);
        assert!(vfs.get(&app.id, "/api/main.rhai").await.unwrap().is_some());
        let index = vfs.get(&app.id, "/index.html").await.unwrap().unwrap();
        assert_eq!(index.mime, "text/html");
    }
}
