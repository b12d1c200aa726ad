//! In-memory metadata store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{decode, encode, MetadataStore};
use crate::error::Result;
use crate::types::{ListFilter, Volume};

/// Metadata store holding the encoded records in a map.
///
/// Values go through the same JSON encoding as [`super::OmapStore`], so a
/// damaged record behaves the same way in both.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes under `id`, bypassing encoding.
    pub async fn put_raw(&self, id: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.records.write().await.insert(id.into(), data.into());
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn put(&self, record: &Volume) -> Result<()> {
        let data = encode(record)?;
        self.records.write().await.insert(record.id.clone(), data);
        debug!(volume_id = %record.id, state = %record.state, "Record stored");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Volume>> {
        let records = self.records.read().await;
        records.get(id).map(|data| decode(id, data)).transpose()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Volume>> {
        if let Some(ref id) = filter.id {
            let volume = self.get(id).await?;
            return Ok(volume.into_iter().filter(|v| filter.matches(v)).collect());
        }

        let records = self.records.read().await;
        let mut volumes = Vec::new();
        for (id, data) in records.iter() {
            if let Some(ref prefix) = filter.id_prefix {
                if !id.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let volume = decode(id, data)?;
            if filter.matches(&volume) {
                volumes.push(volume);
            }
        }
        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VolumeError;
    use crate::types::{VolumeSpec, CLASS_LABEL};

    fn volume(id: &str, class: &str) -> Volume {
        Volume::pending(&VolumeSpec::new(id, class, 1024), None)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let record = volume("vol-1", "fast");

        store.put(&record).await.unwrap();
        assert_eq!(store.get("vol-1").await.unwrap(), Some(record));

        store.delete("vol-1").await.unwrap();
        assert_eq!(store.get("vol-1").await.unwrap(), None);

        // Deleting again is fine
        store.delete("vol-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = MemoryStore::new();
        store.put(&volume("a-1", "fast")).await.unwrap();
        store.put(&volume("a-2", "slow")).await.unwrap();
        store.put(&volume("b-1", "fast")).await.unwrap();

        assert_eq!(store.list(&ListFilter::all()).await.unwrap().len(), 3);
        assert_eq!(store.list(&ListFilter::by_prefix("a-")).await.unwrap().len(), 2);
        assert_eq!(store.list(&ListFilter::by_id("b-1")).await.unwrap().len(), 1);
        assert!(store.list(&ListFilter::by_id("c-1")).await.unwrap().is_empty());

        let fast = store
            .list(&ListFilter::all().with_label(CLASS_LABEL, "fast"))
            .await
            .unwrap();
        let mut ids: Vec<_> = fast.into_iter().map(|v| v.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a-1", "b-1"]);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_surfaced() {
        let store = MemoryStore::new();
        store.put(&volume("good", "fast")).await.unwrap();
        store.put_raw("bad", "not json").await;

        assert!(matches!(
            store.list(&ListFilter::all()).await,
            Err(VolumeError::CorruptMetadata { ref id, .. }) if id == "bad"
        ));
        assert!(store.get("good").await.unwrap().is_some());
        assert!(store.get("bad").await.is_err());
    }
}
