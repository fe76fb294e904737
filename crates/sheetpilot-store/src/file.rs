//! One JSON file per key under a root directory.
//!
//! Filenames are the SHA-256 hex digest of the key, so arbitrary keys are
//! safe on any filesystem. Each file stores the key next to the value so
//! `list` can recover it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sheetpilot_protocol::{CoreResult, KeyValueStore};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    value: Value,
}

#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(format!("{digest}.{RECORD_EXTENSION}"))
    }

    async fn read_record(path: &Path) -> StoreResult<Option<Record>> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(StoreError::io(path, error)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_record(&self, key: &str, value: Value) -> StoreResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|error| StoreError::io(&self.root, error))?;

        let path = self.record_path(key);
        let staging = path.with_extension("tmp");
        let record = Record {
            key: key.to_owned(),
            value,
        };
        let payload = serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Malformed {
            path: path.clone(),
            source,
        })?;
        fs::write(&staging, payload)
            .await
            .map_err(|error| StoreError::io(&staging, error))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|error| StoreError::io(&path, error))?;
        debug!(key, path = %path.display(), "record written");
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StoreError::io(&self.root, error)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| StoreError::io(&self.root, error))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) if record.key.starts_with(prefix) => keys.push(record.key),
                Ok(_) => {}
                Err(error) => warn!(%error, "skipping unreadable record"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let record = Self::read_record(&self.record_path(key)).await?;
        Ok(record.map(|record| record.value))
    }

    async fn set(&self, key: &str, value: Value) -> CoreResult<()> {
        Ok(self.write_record(key, value).await?)
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let path = self.record_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(StoreError::io(path, error).into()),
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
        Ok(self.list_keys(prefix).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use serde_json::json;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn values_survive_a_new_store_instance() -> anyhow::Result<()> {
        let root = unique_test_root("sheetpilot-store");
        let store = FileKeyValueStore::new(&root);
        store.set("ledger/session-1", json!({ "operations": [] })).await?;
        store.set("ledger/session-1", json!({ "operations": [1] })).await?;

        let reopened = FileKeyValueStore::new(&root);
        assert_eq!(
            reopened.get("ledger/session-1").await?,
            Some(json!({ "operations": [1] }))
        );
        assert_eq!(reopened.get("missing").await?, None);

        let _ = fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[tokio::test]
    async fn filenames_are_key_digests() -> anyhow::Result<()> {
        let root = unique_test_root("sheetpilot-store-digest");
        let store = FileKeyValueStore::new(&root);
        store.set("../../etc/passwd", json!(true)).await?;

        let path = store.record_path("../../etc/passwd");
        assert_eq!(path.parent(), Some(root.as_path()));
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        assert_eq!(stem.len(), 64);
        assert!(fs::try_exists(&path).await?);

        let _ = fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[tokio::test]
    async fn list_and_delete() -> anyhow::Result<()> {
        let root = unique_test_root("sheetpilot-store-list");
        let store = FileKeyValueStore::new(&root);
        assert!(store.list("").await?.is_empty());

        store.set("ledger/b", json!(1)).await?;
        store.set("ledger/a", json!(2)).await?;
        store.set("prefs", json!(3)).await?;
        assert_eq!(store.list("ledger/").await?, vec!["ledger/a", "ledger/b"]);

        assert!(store.delete("ledger/a").await?);
        assert!(!store.delete("ledger/a").await?);
        assert_eq!(store.list("").await?, vec!["ledger/b", "prefs"]);

        let _ = fs::remove_dir_all(&root).await;
        Ok(())
    }
}
