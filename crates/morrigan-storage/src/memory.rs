use std::collections::BTreeMap;

use async_trait::async_trait;
use morrigan_core::error::Result;
use morrigan_core::store::{DataStore, Filter, StateStore};
use parking_lot::RwLock;
use serde_json::Value;

/// In-process backend used for local development (`dev mode`) and tests.
/// Keeps keys in a `BTreeMap` so `scan` returns them in order for free.
#[derive(Default)]
pub struct InMemoryDatabase {
    state: RwLock<BTreeMap<String, Vec<u8>>>,
    documents: RwLock<BTreeMap<String, Vec<Value>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryDatabase {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.state.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.write().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .state
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[async_trait]
impl DataStore for InMemoryDatabase {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        Ok(self
            .documents
            .read()
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)).cloned()))
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self
            .documents
            .read()
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        self.documents
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    async fn replace_one(&self, collection: &str, filter: &Filter, doc: Value) -> Result<bool> {
        let mut guard = self.documents.write();
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(false);
        };
        if let Some(slot) = docs.iter_mut().find(|d| filter.matches(d)) {
            *slot = doc;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool> {
        let mut guard = self.documents.write();
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(false);
        };
        let before = docs.len();
        if let Some(pos) = docs.iter().position(|d| filter.matches(d)) {
            docs.remove(pos);
        }
        Ok(docs.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_find_one_roundtrips() {
        let db = InMemoryDatabase::new();
        db.insert_one("identities", serde_json::json!({"id": "a", "name": "admin"}))
            .await
            .unwrap();
        let found = db
            .find_one("identities", &Filter::new().eq("name", "admin"))
            .await
            .unwrap();
        assert_eq!(found.unwrap()["id"], "a");
    }

    #[tokio::test]
    async fn replace_one_returns_false_when_absent() {
        let db = InMemoryDatabase::new();
        let replaced = db
            .replace_one("identities", &Filter::new().eq("id", "missing"), serde_json::json!({}))
            .await
            .unwrap();
        assert!(!replaced);
    }

    #[tokio::test]
    async fn scan_returns_ordered_keys_under_prefix() {
        let db = InMemoryDatabase::new();
        db.put("identity/b", vec![2]).await.unwrap();
        db.put("identity/a", vec![1]).await.unwrap();
        db.put("other/a", vec![9]).await.unwrap();
        let rows = db.scan("identity/").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "identity/a");
        assert_eq!(rows[1].0, "identity/b");
    }

    #[tokio::test]
    async fn delete_one_removes_matching_document() {
        let db = InMemoryDatabase::new();
        db.insert_one("agents", serde_json::json!({"id": "c1"})).await.unwrap();
        let deleted = db
            .delete_one("agents", &Filter::new().eq("id", "c1"))
            .await
            .unwrap();
        assert!(deleted);
        assert!(db
            .find_one("agents", &Filter::new().eq("id", "c1"))
            .await
            .unwrap()
            .is_none());
    }
}
