use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store backend failure: {0}")]
    Backend(String),
    #[error("state decode failure for `{namespace}/{key}`: {detail}")]
    Decode { namespace: String, key: String, detail: String },
}

/// Durable key/value port for admission state, keyed by `(namespace, key)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;
    async fn load_all(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError>;
    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryStateStore {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces.read().await.get(namespace).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.namespaces.read().await.get(namespace).and_then(|entries| entries.get(key)).cloned())
    }

    async fn load_all(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.namespaces
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        if let Some(entries) = self.namespaces.write().await.get_mut(namespace) {
            entries.remove(key);
        }
        Ok(())
    }
}
