//! Document store with a restricted query language
//!
//! Documents are JSON objects in named collections. Queries are a flat map
//! of field -> condition; a condition is either a bare value (equality) or
//! an operator object. Conjunction is implicit: every field must match.
//!
//! Supported operators: $eq $ne $gt $lt $gte $lte $in $contains.

use serde_json::{Map, Value};

use super::Scope;
use crate::ids;
use crate::manifest::json_type;
use crate::store::Store;
use crate::types::{FaztError, Result};

pub struct Docs<'a> {
    store: &'a Store,
    scope: &'a Scope,
}

impl<'a> Docs<'a> {
    pub fn new(store: &'a Store, scope: &'a Scope) -> Self {
        Self { store, scope }
    }

    /// Insert a document. The server assigns `id` unless the caller supplied
    /// one; a caller-supplied `id` must be a string.
    pub async fn insert(&self, collection: &str, mut doc: Value) -> Result<Value> {
        validate_collection(collection)?;
        if !doc.is_object() {
            return Err(type_err("document", &doc, "object"));
        }
        let obj = doc.as_object_mut().unwrap();

        let doc_id = match obj.get("id") {
            None => {
                let id = ids::doc_id();
                obj.insert("id".into(), Value::String(id.clone()));
                id
            }
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(other) => return Err(type_err("document id", other, "string")),
        };

        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let coll = collection.to_string();
        let body = doc.to_string();
        let id = doc_id.clone();

        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO app_docs (app_id, user_id, collection, doc_id, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (app_id, user_id, collection, doc_id)
                       DO UPDATE SET body = excluded.body",
                    rusqlite::params![app, user, coll, id, body],
                )?;
                Ok(())
            })
            .await?;

        Ok(doc)
    }

    /// All documents matching the query, in doc_id order
    pub async fn find(&self, collection: &str, query: &Value) -> Result<Vec<Value>> {
        validate_collection(collection)?;
        let query = parse_query(query)?;
        let docs = self.load_collection(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|d| query.matches(d))
            .collect())
    }

    /// First matching document or None
    pub async fn find_one(&self, collection: &str, query: &Value) -> Result<Option<Value>> {
        Ok(self.find(collection, query).await?.into_iter().next())
    }

    /// Merge `patch` into every matching document, replacing only the
    /// provided fields. Patching `id` is rejected. Returns updated count.
    pub async fn update(&self, collection: &str, query: &Value, patch: &Value) -> Result<usize> {
        validate_collection(collection)?;
        let parsed = parse_query(query)?;
        let patch_obj = patch
            .as_object()
            .ok_or_else(|| type_err("patch", patch, "object"))?;
        if patch_obj.contains_key("id") {
            return Err(FaztError::Validation(
                "the id field is reserved and cannot be patched".into(),
            ));
        }

        let matching = self
            .load_collection(collection)
            .await?
            .into_iter()
            .filter(|d| parsed.matches(d))
            .collect::<Vec<_>>();

        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let coll = collection.to_string();
        let patch_obj = patch_obj.clone();

        let updates: Vec<(String, String)> = matching
            .into_iter()
            .map(|mut doc| {
                let id = doc["id"].as_str().unwrap_or_default().to_string();
                if let Some(obj) = doc.as_object_mut() {
                    for (k, v) in &patch_obj {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                (id, doc.to_string())
            })
            .collect();
        let count = updates.len();

        if count > 0 {
            self.store
                .writes()
                .submit(move |tx| {
                    let mut stmt = tx.prepare_cached(
                        "UPDATE app_docs SET body = ?5
                         WHERE app_id = ?1 AND user_id = ?2 AND collection = ?3 AND doc_id = ?4",
                    )?;
                    for (id, body) in &updates {
                        stmt.execute(rusqlite::params![app, user, coll, id, body])?;
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(count)
    }

    /// Delete matching documents; returns deleted count
    pub async fn delete(&self, collection: &str, query: &Value) -> Result<usize> {
        validate_collection(collection)?;
        let parsed = parse_query(query)?;
        let ids: Vec<String> = self
            .load_collection(collection)
            .await?
            .into_iter()
            .filter(|d| parsed.matches(d))
            .filter_map(|d| d["id"].as_str().map(str::to_string))
            .collect();
        let count = ids.len();

        if count > 0 {
            let app = self.scope.app_id.clone();
            let user = self.scope.user_column();
            let coll = collection.to_string();
            self.store
                .writes()
                .submit(move |tx| {
                    let mut stmt = tx.prepare_cached(
                        "DELETE FROM app_docs
                         WHERE app_id = ?1 AND user_id = ?2 AND collection = ?3 AND doc_id = ?4",
                    )?;
                    for id in &ids {
                        stmt.execute(rusqlite::params![app, user, coll, id])?;
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(count)
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<Value>> {
        let app = self.scope.app_id.clone();
        let user = self.scope.user_column();
        let coll = collection.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT body FROM app_docs
                     WHERE app_id = ?1 AND user_id = ?2 AND collection = ?3
                     ORDER BY doc_id",
                )?;
                let rows = stmt.query_map(rusqlite::params![app, user, coll], |r| {
                    r.get::<_, String>(0)
                })?;
                let mut docs = Vec::new();
                for body in rows {
                    docs.push(serde_json::from_str(&body?)?);
                }
                Ok(docs)
            })
            .await
    }
}

fn validate_collection(name: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(FaztError::Validation(format!(
            "invalid collection name: {name:?}"
        )));
    }
    Ok(())
}

fn type_err(what: &str, got: &Value, expected: &str) -> FaztError {
    FaztError::Validation(format!(
        "{what}: got {}, expected {expected}",
        json_type(got)
    ))
}

/// One field condition after parsing
enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Lt(Value),
    Gte(Value),
    Lte(Value),
    In(Vec<Value>),
    Contains(Value),
}

/// Parsed conjunction of field conditions
struct Query {
    fields: Vec<(String, Condition)>,
}

impl Query {
    fn matches(&self, doc: &Value) -> bool {
        self.fields.iter().all(|(field, cond)| {
            let actual = doc.get(field).unwrap_or(&Value::Null);
            cond.matches(actual)
        })
    }
}

impl Condition {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            Condition::Eq(v) => actual == v,
            Condition::Ne(v) => actual != v,
            Condition::Gt(v) => compare(actual, v).is_some_and(|o| o == std::cmp::Ordering::Greater),
            Condition::Lt(v) => compare(actual, v).is_some_and(|o| o == std::cmp::Ordering::Less),
            Condition::Gte(v) => compare(actual, v).is_some_and(|o| o != std::cmp::Ordering::Less),
            Condition::Lte(v) => {
                compare(actual, v).is_some_and(|o| o != std::cmp::Ordering::Greater)
            }
            Condition::In(options) => options.contains(actual),
            Condition::Contains(needle) => match (actual, needle) {
                (Value::String(hay), Value::String(n)) => hay.contains(n.as_str()),
                (Value::Array(items), n) => items.contains(n),
                _ => false,
            },
        }
    }
}

/// Order comparison over like-typed JSON scalars; mixed types never match
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_query(query: &Value) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| type_err("query", query, "object"))?;

    let mut fields = Vec::with_capacity(obj.len());
    for (field, cond) in obj {
        fields.push((field.clone(), parse_condition(field, cond)?));
    }
    Ok(Query { fields })
}

fn parse_condition(field: &str, cond: &Value) -> Result<Condition> {
    let Some(op_map) = cond.as_object().filter(|m| is_operator_map(m)) else {
        // Bare value: implicit equality
        return Ok(Condition::Eq(cond.clone()));
    };

    if op_map.len() != 1 {
        return Err(FaztError::Validation(format!(
            "query field {field}: exactly one operator per field, got {}",
            op_map.len()
        )));
    }
    let (op, value) = op_map.iter().next().expect("checked non-empty");
    let cond = match op.as_str() {
        "$eq" => Condition::Eq(value.clone()),
        "$ne" => Condition::Ne(value.clone()),
        "$gt" => Condition::Gt(value.clone()),
        "$lt" => Condition::Lt(value.clone()),
        "$gte" => Condition::Gte(value.clone()),
        "$lte" => Condition::Lte(value.clone()),
        "$in" => match value {
            Value::Array(items) => Condition::In(items.clone()),
            other => return Err(type_err(&format!("query {field} $in"), other, "array")),
        },
        "$contains" => Condition::Contains(value.clone()),
        unknown => {
            return Err(FaztError::Validation(format!(
                "query field {field}: unknown operator {unknown}"
            )))
        }
    };
    Ok(cond)
}

fn is_operator_map(m: &Map<String, Value>) -> bool {
    !m.is_empty() && m.keys().all(|k| k.starts_with('$'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AppStorage;
    use serde_json::json;

    async fn temp_docs() -> (AppStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("docs.db")).unwrap();
        (AppStorage::new(store, Scope::app("app_1")), dir)
    }

    #[tokio::test]
    async fn insert_assigns_id() {
        let (storage, _dir) = temp_docs().await;
        let doc = storage
            .docs()
            .insert("items", json!({"name": "a"}))
            .await
            .unwrap();
        let id = doc["id"].as_str().unwrap();
        assert_eq!(id.len(), 12);

        let found = storage
            .docs()
            .find_one("items", &json!({"id": id}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["name"], "a");
    }

    #[tokio::test]
    async fn operators_match() {
        let (storage, _dir) = temp_docs().await;
        let docs = storage.docs();
        docs.insert("n", json!({"v": 1, "tag": "alpha"})).await.unwrap();
        docs.insert("n", json!({"v": 5, "tag": "beta"})).await.unwrap();
        docs.insert("n", json!({"v": 9, "tag": "gamma"})).await.unwrap();

        assert_eq!(docs.find("n", &json!({"v": {"$gt": 4}})).await.unwrap().len(), 2);
        assert_eq!(docs.find("n", &json!({"v": {"$lte": 5}})).await.unwrap().len(), 2);
        assert_eq!(docs.find("n", &json!({"v": {"$ne": 5}})).await.unwrap().len(), 2);
        assert_eq!(
            docs.find("n", &json!({"tag": {"$in": ["alpha", "gamma"]}}))
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            docs.find("n", &json!({"tag": {"$contains": "amm"}}))
                .await
                .unwrap()
                .len(),
            1
        );
        // Implicit conjunction
        assert_eq!(
            docs.find("n", &json!({"v": {"$gt": 0}, "tag": "beta"}))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn update_replaces_only_given_fields() {
        let (storage, _dir) = temp_docs().await;
        let docs = storage.docs();
        docs.insert("u", json!({"id": "one", "a": 1, "b": 2})).await.unwrap();

        let n = docs
            .update("u", &json!({"id": "one"}), &json!({"b": 20}))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let doc = docs.find_one("u", &json!({"id": "one"})).await.unwrap().unwrap();
        assert_eq!(doc["a"], 1);
        assert_eq!(doc["b"], 20);
    }

    #[tokio::test]
    async fn id_cannot_be_patched() {
        let (storage, _dir) = temp_docs().await;
        let docs = storage.docs();
        docs.insert("u", json!({"id": "one"})).await.unwrap();
        let err = docs
            .update("u", &json!({}), &json!({"id": "two"}))
            .await
            .unwrap_err();
        assert!(matches!(err, FaztError::Validation(_)));
    }

    #[tokio::test]
    async fn validation_messages_name_types() {
        let (storage, _dir) = temp_docs().await;
        let err = storage
            .docs()
            .insert("c", json!("not an object"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("got string, expected object"));

        let err = storage
            .docs()
            .find("c", &json!({"x": {"$in": "nope"}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected array"));
    }

    #[tokio::test]
    async fn delete_by_query() {
        let (storage, _dir) = temp_docs().await;
        let docs = storage.docs();
        docs.insert("d", json!({"keep": false})).await.unwrap();
        docs.insert("d", json!({"keep": true})).await.unwrap();

        let n = docs.delete("d", &json!({"keep": false})).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(docs.find("d", &json!({})).await.unwrap().len(), 1);
    }
}
