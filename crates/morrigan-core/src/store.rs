use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Ordered key -> bytes store, namespaced per component. Keys are opaque
/// bytes from the caller's perspective; implementations are free to prefix
/// them with the namespace for physical storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Ordered iteration over all keys under `prefix`, ascending by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

impl dyn StateStore {
    /// Returns a view scoped to `namespace`; keys passed to the child are
    /// transparently prefixed with `<namespace>/`. An inherent method on the
    /// trait object itself (rather than a generic default method) so it can
    /// be called directly on an already-erased `Arc<dyn StateStore>`, which
    /// is the only shape components ever hold a store in.
    pub fn namespaced(self: std::sync::Arc<Self>, namespace: String) -> std::sync::Arc<dyn StateStore> {
        std::sync::Arc::new(NamespacedStateStore {
            inner: self,
            namespace,
        })
    }
}

pub struct NamespacedStateStore {
    inner: std::sync::Arc<dyn StateStore>,
    namespace: String,
}

impl NamespacedStateStore {
    fn scoped(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }
}

#[async_trait]
impl StateStore for NamespacedStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.put(&self.scoped(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let full_prefix = self.scoped(prefix);
        let rows = self.inner.scan(&full_prefix).await?;
        let strip = format!("{}/", self.namespace);
        Ok(rows
            .into_iter()
            .map(|(k, v)| (k.strip_prefix(strip.as_str()).unwrap_or(&k).to_string(), v))
            .collect())
    }
}

/// A simple equality filter against top-level document fields; sufficient
/// for every query this system issues (lookup by id, by subject, by name).
#[derive(Debug, Clone, Default)]
pub struct Filter(pub Vec<(String, Value)>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.0.iter().all(|(field, expected)| {
            doc.get(field)
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
    }
}

/// Document collections with the five operations the spec's data model
/// needs: `findOne/find/insertOne/replaceOne/deleteOne`.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>>;
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>>;
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()>;
    async fn replace_one(&self, collection: &str, filter: &Filter, doc: Value) -> Result<bool>;
    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool>;
}

impl dyn DataStore {
    /// Scoped view whose collection names are transparently prefixed with
    /// `<namespace>.`. `discard` (bulk collection drop) is intentionally not
    /// part of this trait so it cannot be exposed to delegated components.
    /// An inherent method on the trait object so components, which only ever
    /// hold an already-erased `Arc<dyn DataStore>`, can call it directly.
    pub fn namespaced(self: std::sync::Arc<Self>, namespace: String) -> std::sync::Arc<dyn DataStore> {
        std::sync::Arc::new(NamespacedDataStore {
            inner: self,
            namespace,
        })
    }
}

pub struct NamespacedDataStore {
    inner: std::sync::Arc<dyn DataStore>,
    namespace: String,
}

impl NamespacedDataStore {
    fn scoped(&self, collection: &str) -> String {
        format!("{}.{}", self.namespace, collection)
    }
}

#[async_trait]
impl DataStore for NamespacedDataStore {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        self.inner.find_one(&self.scoped(collection), filter).await
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        self.inner.find(&self.scoped(collection), filter).await
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        self.inner.insert_one(&self.scoped(collection), doc).await
    }

    async fn replace_one(&self, collection: &str, filter: &Filter, doc: Value) -> Result<bool> {
        self.inner
            .replace_one(&self.scoped(collection), filter, doc)
            .await
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool> {
        self.inner
            .delete_one(&self.scoped(collection), filter)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_all_fields() {
        let doc = serde_json::json!({"id": "a", "name": "x"});
        let f = Filter::new().eq("id", "a").eq("name", "x");
        assert!(f.matches(&doc));
        let f2 = Filter::new().eq("id", "a").eq("name", "y");
        assert!(!f2.matches(&doc));
    }
}
