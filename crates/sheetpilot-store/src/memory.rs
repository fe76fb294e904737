use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sheetpilot_protocol::{CoreResult, KeyValueStore};

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> CoreResult<()> {
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn list_filters_by_prefix_in_order() -> anyhow::Result<()> {
        let store = MemoryKeyValueStore::new();
        store.set("ledger/b", json!(2)).await?;
        store.set("ledger/a", json!(1)).await?;
        store.set("prefs/theme", json!("dark")).await?;

        assert_eq!(store.list("ledger/").await?, vec!["ledger/a", "ledger/b"]);
        assert!(store.delete("ledger/a").await?);
        assert!(!store.delete("ledger/a").await?);
        assert_eq!(store.get("ledger/b").await?, Some(json!(2)));
        assert_eq!(store.len(), 2);
        Ok(())
    }
}
