use async_trait::async_trait;
use morrigan_core::error::{Error, Result};
use morrigan_core::store::{DataStore, Filter, StateStore};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// The durable backend: Postgres via `sqlx`, one pool shared by the state
/// store and the data store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| Error::server_configuration(format!("database connect failed: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::server_configuration(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for Database {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM state_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("state get failed: {e}")))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO state_entries (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::server_error(format!("state put failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM state_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("state delete failed: {e}")))?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let like = format!("{prefix}%");
        let rows = sqlx::query("SELECT key, value FROM state_entries WHERE key LIKE $1 ORDER BY key ASC")
            .bind(like)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("state scan failed: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}

fn filter_to_jsonb(filter: &Filter) -> Value {
    Value::Object(filter.0.iter().cloned().collect())
}

#[async_trait]
impl DataStore for Database {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let containment = filter_to_jsonb(filter);
        let row = sqlx::query(
            "SELECT doc FROM documents WHERE collection = $1 AND doc @> $2 LIMIT 1",
        )
        .bind(collection)
        .bind(&containment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::server_error(format!("find_one failed: {e}")))?;
        Ok(row.map(|r| r.get::<Value, _>("doc")))
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        let containment = filter_to_jsonb(filter);
        let rows = sqlx::query("SELECT doc FROM documents WHERE collection = $1 AND doc @> $2")
            .bind(collection)
            .bind(&containment)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("find failed: {e}")))?;
        Ok(rows.into_iter().map(|r| r.get::<Value, _>("doc")).collect())
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        sqlx::query("INSERT INTO documents (collection, doc) VALUES ($1, $2)")
            .bind(collection)
            .bind(&doc)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("insert_one failed: {e}")))?;
        Ok(())
    }

    async fn replace_one(&self, collection: &str, filter: &Filter, doc: Value) -> Result<bool> {
        let containment = filter_to_jsonb(filter);
        let existing = sqlx::query(
            "SELECT row_id FROM documents WHERE collection = $1 AND doc @> $2 LIMIT 1",
        )
        .bind(collection)
        .bind(&containment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::server_error(format!("replace_one lookup failed: {e}")))?;

        let Some(row) = existing else {
            return Ok(false);
        };
        let row_id: i64 = row.get("row_id");
        sqlx::query("UPDATE documents SET doc = $1 WHERE row_id = $2")
            .bind(&doc)
            .bind(row_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("replace_one update failed: {e}")))?;
        Ok(true)
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool> {
        let containment = filter_to_jsonb(filter);
        let existing = sqlx::query(
            "SELECT row_id FROM documents WHERE collection = $1 AND doc @> $2 LIMIT 1",
        )
        .bind(collection)
        .bind(&containment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::server_error(format!("delete_one lookup failed: {e}")))?;

        let Some(row) = existing else {
            return Ok(false);
        };
        let row_id: i64 = row.get("row_id");
        sqlx::query("DELETE FROM documents WHERE row_id = $1")
            .bind(row_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::server_error(format!("delete_one failed: {e}")))?;
        Ok(true)
    }
}
