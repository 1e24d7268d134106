//! Storage adapter for device records.
//!
//! The registry persists one [`DeviceRecord`] per client name and restores
//! them at startup. Two backends ship with the server:
//!
//! - [`MemoryStorage`]: process-local map, used by tests and ephemeral setups
//! - [`JsonFileStorage`]: the same map flushed to a JSON document on change
//!
//! ```text
//! RegistryActor ──save/updateAttrs/patchSo──▶ dyn Storage ──▶ map (+ file)
//! ```

use async_trait::async_trait;
use serde_json::Value;
use shepherd_core::{AttrsDiff, ClientName, DeviceRecord};
use thiserror::Error;

mod file;
mod memory;

pub use file::JsonFileStorage;
pub use memory::MemoryStorage;

/// Identity key that no diff may touch.
const IDENTITY_KEY: &str = "clientName";

/// Errors returned by storage backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("no record for {0}")]
    NotFound(ClientName),

    #[error("invalid diff: {0}")]
    InvalidDiff(String),

    #[error("storage i/o failed: {0}")]
    Io(String),

    #[error("storage serialization failed: {0}")]
    Serialization(String),
}

/// Persistence interface consumed by the registry.
///
/// `update_attrs` replaces whole top-level fields while `patch_so` deep-merges
/// into the resource tree. Both return `None` for an empty diff and reject a
/// diff containing the identity key.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Inserts or replaces the record.
    async fn save(&self, record: DeviceRecord) -> Result<DeviceRecord, StorageError>;

    async fn load(&self, client_name: &ClientName) -> Result<DeviceRecord, StorageError>;

    async fn load_all(&self) -> Result<Vec<DeviceRecord>, StorageError>;

    /// Returns whether a record was removed.
    async fn remove(&self, client_name: &ClientName) -> Result<bool, StorageError>;

    async fn update_attrs(
        &self,
        client_name: &ClientName,
        diff: &AttrsDiff,
    ) -> Result<Option<AttrsDiff>, StorageError>;

    async fn patch_so(
        &self,
        client_name: &ClientName,
        patch: &Value,
    ) -> Result<Option<Value>, StorageError>;

    /// Removes every record, returning how many there were.
    async fn reset(&self) -> Result<usize, StorageError>;
}

// ============================================================================
// Shared record mutation
// ============================================================================

/// Applies an attribute diff to a record in place.
fn apply_attrs(
    record: &mut DeviceRecord,
    diff: &AttrsDiff,
) -> Result<Option<AttrsDiff>, StorageError> {
    if diff.is_empty() {
        return Ok(None);
    }
    if diff.contains_key(IDENTITY_KEY) {
        return Err(StorageError::InvalidDiff(format!("{IDENTITY_KEY} cannot change")));
    }
    record
        .apply_diff(diff)
        .map_err(|e| StorageError::InvalidDiff(e.to_string()))?;
    Ok(Some(diff.clone()))
}

/// Deep-merges a resource patch into a record's tree.
fn apply_so_patch(record: &mut DeviceRecord, patch: &Value) -> Result<Option<Value>, StorageError> {
    let Some(fields) = patch.as_object() else {
        return Err(StorageError::InvalidDiff("resource patch must be an object".to_string()));
    };
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.contains_key(IDENTITY_KEY) {
        return Err(StorageError::InvalidDiff(format!("{IDENTITY_KEY} cannot change")));
    }
    record.so.apply_patch(patch);
    Ok(Some(patch.clone()))
}
