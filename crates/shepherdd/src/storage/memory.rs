//! In-memory storage backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use shepherd_core::{AttrsDiff, ClientName, DeviceRecord};

use super::{apply_attrs, apply_so_patch, Storage, StorageError};

/// Records kept in a map behind an async lock.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<ClientName, DeviceRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-filled with `records`.
    pub fn with_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|record| (record.client_name.clone(), record))
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }

    /// Copy of every record, for flushing.
    pub(super) async fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, record: DeviceRecord) -> Result<DeviceRecord, StorageError> {
        debug!(client_name = %record.client_name, "Saving record");
        self.records
            .write()
            .await
            .insert(record.client_name.clone(), record.clone());
        Ok(record)
    }

    async fn load(&self, client_name: &ClientName) -> Result<DeviceRecord, StorageError> {
        self.records
            .read()
            .await
            .get(client_name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(client_name.clone()))
    }

    async fn load_all(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        Ok(self.snapshot().await)
    }

    async fn remove(&self, client_name: &ClientName) -> Result<bool, StorageError> {
        Ok(self.records.write().await.remove(client_name).is_some())
    }

    async fn update_attrs(
        &self,
        client_name: &ClientName,
        diff: &AttrsDiff,
    ) -> Result<Option<AttrsDiff>, StorageError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(client_name)
            .ok_or_else(|| StorageError::NotFound(client_name.clone()))?;
        apply_attrs(record, diff)
    }

    async fn patch_so(
        &self,
        client_name: &ClientName,
        patch: &Value,
    ) -> Result<Option<Value>, StorageError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(client_name)
            .ok_or_else(|| StorageError::NotFound(client_name.clone()))?;
        apply_so_patch(record, patch)
    }

    async fn reset(&self) -> Result<usize, StorageError> {
        let mut records = self.records.write().await;
        let count = records.len();
        records.clear();
        Ok(count)
    }
}
