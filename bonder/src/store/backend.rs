// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{BonderError, BonderResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Key selection for range scans. Results are always ordered by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    All,
    Prefix(String),
    /// `start <= key < end`
    Between { start: String, end: String },
}

impl KeyRange {
    pub fn contains(&self, key: &str) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyRange::Between { start, end } => key >= start.as_str() && key < end.as_str(),
        }
    }
}

/// Namespaced JSON key/value storage. `merge` must be atomic per key.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> BonderResult<Option<Value>>;

    async fn put(&self, namespace: &str, key: &str, value: Value) -> BonderResult<()>;

    /// Merge `patch` into the stored object (or an empty one) and return the result.
    async fn merge(&self, namespace: &str, key: &str, patch: Value) -> BonderResult<Value>;

    async fn delete(&self, namespace: &str, key: &str) -> BonderResult<bool>;

    async fn scan(&self, namespace: &str, range: KeyRange) -> BonderResult<Vec<(String, Value)>>;
}

/// Recursive object merge. Nulls in the patch are ignored; arrays and scalars
/// replace what was there.
pub fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    continue;
                }
                let nested = value.is_object()
                    && target.get(&key).map(Value::is_object).unwrap_or(false);
                if nested {
                    if let Some(existing) = target.get_mut(&key) {
                        merge_json(existing, value);
                    }
                } else {
                    target.insert(key, value);
                }
            }
        }
        (target, patch) => {
            if !patch.is_null() {
                *target = patch;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<(String, String), Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, namespace: &str, key: &str) -> BonderResult<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> BonderResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn merge(&self, namespace: &str, key: &str, patch: Value) -> BonderResult<Value> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry((namespace.to_string(), key.to_string()))
            .or_insert_with(|| Value::Object(Default::default()));
        merge_json(entry, patch);
        Ok(entry.clone())
    }

    async fn delete(&self, namespace: &str, key: &str) -> BonderResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn scan(&self, namespace: &str, range: KeyRange) -> BonderResult<Vec<(String, Value)>> {
        let entries = self.entries.read().await;
        let start = (namespace.to_string(), String::new());
        Ok(entries
            .range(start..)
            .take_while(|((ns, _), _)| ns == namespace)
            .filter(|((_, key), _)| range.contains(key))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// SQLite-backed store, one `kv` table holding JSON text.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> BonderResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(storage_err)?;
            }
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> BonderResult<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn init(conn: Connection) -> BonderResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 namespace TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (namespace, key)
             ) WITHOUT ROWID;",
        )
        .map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> BonderResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> BonderResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| BonderError::StorageError("sqlite connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| BonderError::StorageError(format!("storage task failed: {}", e)))?
    }
}

fn storage_err(e: impl std::fmt::Display) -> BonderError {
    BonderError::StorageError(e.to_string())
}

fn decode(text: String) -> BonderResult<Value> {
    serde_json::from_str(&text).map_err(|e| BonderError::SerializationError(e.to_string()))
}

fn read_value(conn: &Connection, namespace: &str, key: &str) -> BonderResult<Option<Value>> {
    conn.query_row(
        "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
        params![namespace, key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(storage_err)?
    .map(decode)
    .transpose()
}

fn write_value(conn: &Connection, namespace: &str, key: &str, value: &Value) -> BonderResult<()> {
    conn.execute(
        "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
        params![namespace, key, value.to_string()],
    )
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, namespace: &str, key: &str) -> BonderResult<Option<Value>> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| read_value(conn, &namespace, &key))
            .await
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> BonderResult<()> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| write_value(conn, &namespace, &key, &value))
            .await
    }

    async fn merge(&self, namespace: &str, key: &str, patch: Value) -> BonderResult<Value> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            let mut value =
                read_value(&tx, &namespace, &key)?.unwrap_or(Value::Object(Default::default()));
            merge_json(&mut value, patch);
            write_value(&tx, &namespace, &key, &value)?;
            tx.commit().map_err(storage_err)?;
            Ok(value)
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> BonderResult<bool> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                )
                .map_err(storage_err)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn scan(&self, namespace: &str, range: KeyRange) -> BonderResult<Vec<(String, Value)>> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![namespace], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(storage_err)?;
            let mut out = Vec::new();
            for row in rows {
                let (key, text) = row.map_err(storage_err)?;
                if range.contains(&key) {
                    out.push((key, decode(text)?));
                }
            }
            Ok(out)
        })
        .await
    }
}
