//! Schema migrations
//!
//! Append-only list; each migration runs in its own transaction and the
//! schema_version row advances atomically with it. Never edit an entry that
//! has shipped - add a new one.

use rusqlite::Connection;
use tracing::info;

use crate::types::{FaztError, Result};

/// One migration step
struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
        CREATE TABLE apps (
            id             TEXT PRIMARY KEY,
            name           TEXT NOT NULL,
            manifest       TEXT NOT NULL,
            original_id    TEXT,
            forked_from_id TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );

        CREATE TABLE aliases (
            subdomain  TEXT PRIMARY KEY,
            kind       TEXT NOT NULL,
            targets    TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE files (
            app_id     TEXT NOT NULL,
            path       TEXT NOT NULL,
            mime_type  TEXT NOT NULL,
            size       INTEGER NOT NULL,
            content    BLOB NOT NULL,
            sha256     TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (app_id, path)
        );

        CREATE TABLE users (
            id          TEXT PRIMARY KEY,
            provider    TEXT NOT NULL,
            external_id TEXT NOT NULL,
            email       TEXT NOT NULL,
            name        TEXT NOT NULL,
            role        TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE (provider, external_id)
        );

        CREATE TABLE sessions (
            token      TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            app_id     TEXT,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE invites (
            code       TEXT PRIMARY KEY,
            role       TEXT NOT NULL,
            consumed   INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT
        );

        CREATE TABLE app_kv (
            app_id     TEXT NOT NULL,
            user_id    TEXT NOT NULL DEFAULT '',
            key        TEXT NOT NULL,
            value      BLOB NOT NULL,
            expires_at TEXT,
            PRIMARY KEY (app_id, user_id, key)
        );

        CREATE TABLE app_docs (
            app_id     TEXT NOT NULL,
            user_id    TEXT NOT NULL DEFAULT '',
            collection TEXT NOT NULL,
            doc_id     TEXT NOT NULL,
            body       TEXT NOT NULL,
            PRIMARY KEY (app_id, user_id, collection, doc_id)
        );

        CREATE TABLE app_blobs (
            app_id    TEXT NOT NULL,
            user_id   TEXT NOT NULL DEFAULT '',
            path      TEXT NOT NULL,
            content   BLOB NOT NULL,
            mime_type TEXT NOT NULL,
            sha256    TEXT NOT NULL,
            PRIMARY KEY (app_id, user_id, path)
        );

        CREATE TABLE jobs (
            id              TEXT PRIMARY KEY,
            app_id          TEXT NOT NULL,
            name            TEXT NOT NULL,
            status          TEXT NOT NULL,
            daemon          INTEGER NOT NULL DEFAULT 0,
            memory_budget   INTEGER NOT NULL,
            timeout_ms      INTEGER,
            restart_count   INTEGER NOT NULL DEFAULT 0,
            checkpoint      TEXT,
            idle_channel    TEXT,
            idle_timeout_ms INTEGER,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE activity_log (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            ts            TEXT NOT NULL,
            actor_type    TEXT NOT NULL,
            actor_id      TEXT,
            action        TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id   TEXT NOT NULL,
            result        TEXT NOT NULL,
            weight        INTEGER NOT NULL DEFAULT 0,
            detail        TEXT
        );

        CREATE TABLE peers (
            name      TEXT PRIMARY KEY,
            url       TEXT NOT NULL,
            token     TEXT NOT NULL,
            last_seen TEXT,
            version   TEXT
        );

        CREATE TABLE certs (
            domain     TEXT PRIMARY KEY,
            cert_pem   TEXT NOT NULL,
            key_pem    TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_files_prefix ON files (app_id, path);
        CREATE INDEX idx_kv_expiry ON app_kv (expires_at) WHERE expires_at IS NOT NULL;
        CREATE INDEX idx_docs_collection ON app_docs (app_id, user_id, collection);
        CREATE INDEX idx_sessions_user ON sessions (user_id);
        CREATE INDEX idx_jobs_app ON jobs (app_id, status);
        CREATE INDEX idx_activity_ts ON activity_log (ts);
        "#,
    },
];

/// Apply unapplied migrations in order. Fatal on failure: the caller aborts
/// startup rather than serving against an unknown schema.
pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    )
    .map_err(|e| FaztError::Migration(e.to_string()))?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| {
            r.get(0)
        })
        .map_err(|e| FaztError::Migration(e.to_string()))?;

    for m in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .transaction()
            .map_err(|e| FaztError::Migration(e.to_string()))?;
        tx.execute_batch(m.sql)
            .map_err(|e| FaztError::Migration(format!("v{}: {e}", m.version)))?;
        tx.execute("DELETE FROM schema_version", [])
            .map_err(|e| FaztError::Migration(e.to_string()))?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [m.version],
        )
        .map_err(|e| FaztError::Migration(e.to_string()))?;
        tx.commit()
            .map_err(|e| FaztError::Migration(format!("v{}: {e}", m.version)))?;
        info!("Applied schema migration v{}", m.version);
    }

    Ok(())
}

/// Current schema version (0 before any migration)
pub fn version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_cleanly() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(version(&conn).unwrap(), 1);

        // Re-running is a no-op
        run(&mut conn).unwrap();
        assert_eq!(version(&conn).unwrap(), 1);
    }

    #[test]
    fn tables_exist_after_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('apps','aliases','files','users','sessions','invites','app_kv',
                  'app_docs','app_blobs','jobs','activity_log','peers','certs')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 13);
    }
}
