//! In-memory backend
//!
//! Handlers opened from the same [`MemoryStore`] share one map, so clones of
//! a [`super::StoreManager`] see each other's writes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{HandlerFactory, StoreError, StoreHandler};
use crate::model::RecordKind;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<(RecordKind, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandlerFactory for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(&self) -> Result<Arc<dyn StoreHandler>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl StoreHandler for MemoryStore {
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Value, StoreError> {
        self.records
            .get(&(kind, key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found(kind, key))
    }

    async fn save(&self, kind: RecordKind, key: &str, value: Value) -> Result<Value, StoreError> {
        self.records.insert((kind, key.to_string()), value.clone());
        Ok(value)
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<(), StoreError> {
        self.records
            .remove(&(kind, key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(kind, key))
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        let mut entries: Vec<(String, Value)> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, value)| value).collect())
    }
}
