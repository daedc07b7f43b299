//! In-memory key-value backend

use async_trait::async_trait;
use dashmap::DashMap;

use super::store::KeyValueStore;
use crate::types::Result;

/// Volatile backend. Records are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.records.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String> {
        let entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        Ok(entry.value().clone())
    }
}
