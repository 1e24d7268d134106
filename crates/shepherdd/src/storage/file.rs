//! JSON file storage backend.
//!
//! All records live in memory and the whole set is rewritten to disk after
//! each mutation: written to `<path>.tmp`, then renamed over `<path>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use shepherd_core::{AttrsDiff, ClientName, DeviceRecord};

use super::{MemoryStorage, Storage, StorageError};

/// Records persisted as a JSON array in a single file.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    inner: MemoryStorage,
    /// Serializes flushes so renames never interleave
    flush_lock: Mutex<()>,
}

impl JsonFileStorage {
    /// Opens the store, loading existing records when the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice::<Vec<DeviceRecord>>(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        info!(path = %path.display(), records = records.len(), "Opened device store");

        Ok(Self {
            path,
            inner: MemoryStorage::with_records(records),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.flush_lock.lock().await;
        let records = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&records)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        debug!(path = %self.path.display(), records = records.len(), "Flushed device store");
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn save(&self, record: DeviceRecord) -> Result<DeviceRecord, StorageError> {
        let saved = self.inner.save(record).await?;
        self.flush().await?;
        Ok(saved)
    }

    async fn load(&self, client_name: &ClientName) -> Result<DeviceRecord, StorageError> {
        self.inner.load(client_name).await
    }

    async fn load_all(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        self.inner.load_all().await
    }

    async fn remove(&self, client_name: &ClientName) -> Result<bool, StorageError> {
        let removed = self.inner.remove(client_name).await?;
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn update_attrs(
        &self,
        client_name: &ClientName,
        diff: &AttrsDiff,
    ) -> Result<Option<AttrsDiff>, StorageError> {
        let applied = self.inner.update_attrs(client_name, diff).await?;
        if applied.is_some() {
            self.flush().await?;
        }
        Ok(applied)
    }

    async fn patch_so(
        &self,
        client_name: &ClientName,
        patch: &Value,
    ) -> Result<Option<Value>, StorageError> {
        let applied = self.inner.patch_so(client_name, patch).await?;
        if applied.is_some() {
            self.flush().await?;
        }
        Ok(applied)
    }

    async fn reset(&self) -> Result<usize, StorageError> {
        let count = self.inner.reset().await?;
        self.flush().await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shepherd_core::{ClientId, DeviceAttrs, ObjectList};

    fn record(name: &str) -> DeviceRecord {
        let attrs = DeviceAttrs {
            client_name: Some(ClientName::new(name)),
            object_list: Some(ObjectList::new()),
            ip: "10.0.0.3".to_string(),
            port: 5683,
            ..DeviceAttrs::default()
        };
        DeviceRecord::from_registration(ClientName::new(name), ClientId::new(7), ObjectList::new(), &attrs)
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.json");

        let store = JsonFileStorage::open(&path).await.unwrap();
        store.save(record("dev1")).await.unwrap();
        store
            .patch_so(&ClientName::new("dev1"), &json!({"3": {"0": {"9": 87}}}))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStorage::open(&path).await.unwrap();
        let loaded = reopened.load(&ClientName::new("dev1")).await.unwrap();
        assert_eq!(loaded.client_id, ClientId::new(7));
        assert_eq!(loaded.so.dump(), json!({"3": {"0": {"9": 87}}}));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            JsonFileStorage::open(&path).await,
            Err(StorageError::Serialization(_))
        ));
    }
}
