//! Per-app persistent storage
//!
//! KV, document, and blob stores scoped by (app_id, optional user_id).
//! Cross-app access is impossible at this boundary: every query carries the
//! scope and the scope is constructed by the invoker, never by script code.
//! All mutations ride the write queue; reads use the pooled read path.

pub mod blobs;
pub mod docs;
pub mod kv;

use crate::store::Store;

/// Storage scope: the app, and optionally one user within it.
///
/// The user id is stored as an empty string in the tables so the composite
/// primary keys stay NOT NULL; `None` here means app-level scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub app_id: String,
    pub user_id: Option<String>,
}

impl Scope {
    pub fn app(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            user_id: None,
        }
    }

    pub fn user(app_id: &str, user_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            user_id: Some(user_id.to_string()),
        }
    }

    /// Column value for the user_id key component
    pub fn user_column(&self) -> String {
        self.user_id.clone().unwrap_or_default()
    }
}

/// Storage facade handed to handler invocations and jobs
#[derive(Clone)]
pub struct AppStorage {
    store: Store,
    scope: Scope,
}

impl AppStorage {
    pub fn new(store: Store, scope: Scope) -> Self {
        Self { store, scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn kv(&self) -> kv::Kv<'_> {
        kv::Kv::new(&self.store, &self.scope)
    }

    pub fn docs(&self) -> docs::Docs<'_> {
        docs::Docs::new(&self.store, &self.scope)
    }

    pub fn blobs(&self) -> blobs::Blobs<'_> {
        blobs::Blobs::new(&self.store, &self.scope)
    }

    /// Drop every row owned by an app, across all three stores and all
    /// users. Called when the app is deleted.
    pub async fn delete_app_data(store: &Store, app_id: &str) -> crate::types::Result<()> {
        let id = app_id.to_string();
        store
            .writes()
            .submit(move |tx| {
                tx.execute("DELETE FROM app_kv WHERE app_id = ?1", [&id])?;
                tx.execute("DELETE FROM app_docs WHERE app_id = ?1", [&id])?;
                tx.execute("DELETE FROM app_blobs WHERE app_id = ?1", [&id])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_distinct() {
        let app = Scope::app("app_1");
        let user = Scope::user("app_1", "usr_1");
        assert_ne!(app, user);
        assert_eq!(app.user_column(), "");
        assert_eq!(user.user_column(), "usr_1");
    }
}
