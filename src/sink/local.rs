//! Local filesystem payload sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::{HarvestError, Result};
use crate::models::WorkItem;
use crate::sink::PayloadSink;

/// Writes each payload to `{root}/{partition}/{item_id}.json`.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root_dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Target path for an item. Rejects ids that would escape the root.
    pub fn path_for(&self, item: &WorkItem) -> Result<PathBuf> {
        for part in [&item.partition_key, &item.item_id] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\'])
            {
                return Err(HarvestError::sink(
                    &item.item_id,
                    format!("unsafe path component {part:?}"),
                ));
            }
        }
        Ok(self
            .root_dir
            .join(&item.partition_key)
            .join(format!("{}.json", item.item_id)))
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl PayloadSink for JsonDirSink {
    async fn store(&self, item: &WorkItem, payload: &Value) -> Result<()> {
        let path = self.path_for(item)?;
        let bytes = serde_json::to_vec_pretty(payload)?;
        self.write_bytes(&path, &bytes)
            .await
            .map_err(|e| HarvestError::sink(&item.item_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewWorkItem;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str, partition: &str) -> WorkItem {
        NewWorkItem::new(id, partition, "https://example.com").into_pending(3, Utc::now())
    }

    #[tokio::test]
    async fn test_store_writes_partitioned_json() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonDirSink::new(tmp.path());
        let item = item("doc-1", "alpha");

        sink.store(&item, &json!({"a": 1})).await.unwrap();
        sink.store(&item, &json!({"a": 2})).await.unwrap();

        let path = tmp.path().join("alpha").join("doc-1.json");
        let stored: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored, json!({"a": 2}));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_ids() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonDirSink::new(tmp.path());

        let err = sink
            .store(&item("../evil", "alpha"), &json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Sink { .. }));
        assert!(sink.path_for(&item("ok", "..")).is_err());
    }
}
