//! Run-scoped, key-addressed store shared by node capabilities.
//!
//! The store has exactly one write path, [`ExecutionStore::update`], which
//! performs the read-modify-write under a lock and bumps a per-key version.
//! Concurrent writers therefore never lose each other's updates.

use crate::Value;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreEntry {
    pub value: Value,
    /// Number of committed updates for this key.
    pub version: u64,
}

#[derive(Debug, Default)]
pub struct ExecutionStore {
    entries: Mutex<HashMap<String, StoreEntry>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<StoreEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Apply `f` to the current value of `key` (if any) and store the result.
    ///
    /// Returns the committed entry.
    pub async fn update<F>(&self, key: impl Into<String>, f: F) -> StoreEntry
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let key = key.into();
        let mut entries = self.entries.lock().await;
        let current = entries.get(&key);
        let value = f(current.map(|entry| &entry.value));
        let version = current.map_or(0, |entry| entry.version) + 1;
        let entry = StoreEntry { value, version };
        entries.insert(key.clone(), entry.clone());
        tracing::trace!("store key '{}' now at version {}", key, version);
        entry
    }

    /// Append `values` to the array stored under `key`, creating it if needed.
    pub async fn append(&self, key: impl Into<String>, values: Vec<Value>) -> StoreEntry {
        self.update(key, move |current| {
            let mut items = match current {
                Some(Value::Array(existing)) => existing.clone(),
                Some(other) => vec![other.clone()],
                None => Vec::new(),
            };
            items.extend(values);
            Value::Array(items)
        })
        .await
    }

    pub async fn snapshot(&self) -> HashMap<String, StoreEntry> {
        self.entries.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let store = Arc::new(ExecutionStore::new());
        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.append("log", vec![Value::from(i as i64)]).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let entry = store.get("log").await.unwrap();
        assert_eq!(entry.version, 20);
        assert_eq!(entry.value.as_array().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn update_sees_previous_value() {
        let store = ExecutionStore::new();
        store.update("n", |_| Value::from(1i64)).await;
        let entry = store
            .update("n", |current| {
                Value::from(current.and_then(Value::as_f64).unwrap_or(0.0) + 1.0)
            })
            .await;
        assert_eq!(entry.value, Value::Number(2.0));
        assert_eq!(entry.version, 2);
    }
}
