//! Per-device settings and state persistence using JSON file storage

use crate::device::DeviceId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs;

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON file store holding one settings file and one state file per device
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    #[must_use] pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `$DATA_DIR/devices` (default `./data/devices`)
    #[must_use] pub fn from_env() -> Self {
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        Self::new(PathBuf::from(data_dir).join("devices"))
    }

    #[must_use] pub fn root(&self) -> &Path {
        &self.root
    }

    fn settings_path(&self, device: &DeviceId) -> PathBuf {
        self.root.join(format!("{}.settings.json", device.file_stem()))
    }

    fn state_path(&self, device: &DeviceId) -> PathBuf {
        self.root.join(format!("{}.state.json", device.file_stem()))
    }

    /// Load the settings of a device, `None` when absent or unreadable
    pub async fn load_settings<T: DeserializeOwned>(&self, device: &DeviceId) -> Option<T> {
        load_json(&self.settings_path(device)).await
    }

    /// Save the settings of a device
    #[allow(clippy::missing_errors_doc)]
    pub async fn save_settings<T: Serialize>(
        &self,
        device: &DeviceId,
        settings: &T,
    ) -> Result<(), StoreError> {
        save_json(&self.settings_path(device), settings).await
    }

    /// Load the last persisted state of a device, `None` when absent or unreadable
    pub async fn load_state<T: DeserializeOwned>(&self, device: &DeviceId) -> Option<T> {
        load_json(&self.state_path(device)).await
    }

    /// Persist the current state of a device
    #[allow(clippy::missing_errors_doc)]
    pub async fn persist<T: Serialize>(&self, device: &DeviceId, state: &T) -> Result<(), StoreError> {
        save_json(&self.state_path(device), state).await
    }
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<T>(&contents) {
            Ok(value) => {
                tracing::debug!("Loaded {:?}", path);
                Some(value)
            }
            Err(e) => {
                tracing::warn!("Failed to parse {:?}: {}", path, e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No file found at {:?}", path);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", path, e);
            None
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(value)?;

    // Write atomically: write to temp file, then rename. Concurrent saves of
    // one file each get their own temp file.
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = path.with_extension(format!("json.{seq}.tmp"));
    fs::write(&tmp_path, &json).await?;
    fs::rename(&tmp_path, path).await?;

    tracing::debug!("Saved {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        on: bool,
        level: u8,
    }

    fn temp_store() -> JsonStore {
        JsonStore::new(std::env::temp_dir().join(format!("device-core-{}", uuid::Uuid::new_v4())))
    }

    #[tokio::test]
    async fn test_missing_files_load_as_none() {
        let store = temp_store();
        let device = DeviceId::new("lamp");
        assert!(store.load_state::<Sample>(&device).await.is_none());
        assert!(store.load_settings::<Sample>(&device).await.is_none());
    }

    #[tokio::test]
    async fn test_persist_then_load_state() {
        let store = temp_store();
        let device = DeviceId::new("hall/lamp");
        let state = Sample { on: true, level: 40 };

        store.persist(&device, &state).await.unwrap();
        let loaded: Option<Sample> = store.load_state(&device).await;
        assert_eq!(loaded, Some(state));

        // Settings live in a separate file
        assert!(store.load_settings::<Sample>(&device).await.is_none());
        let _ = std::fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_as_none() {
        let store = temp_store();
        let device = DeviceId::new("lamp");
        std::fs::create_dir_all(store.root()).unwrap();
        std::fs::write(store.root().join("lamp.settings.json"), "{ not json").unwrap();

        assert!(store.load_settings::<Sample>(&device).await.is_none());
        let _ = std::fs::remove_dir_all(store.root());
    }
}
