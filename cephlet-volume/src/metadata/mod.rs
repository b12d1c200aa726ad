//! Durable per-volume metadata.
//!
//! Records are stored as JSON values keyed by volume ID. Two stores are
//! provided:
//!
//! | Store | Backing |
//! |-------|---------|
//! | [`OmapStore`] | omap of one RADOS object in the volume pool |
//! | [`MemoryStore`] | in-process map, for tests and development |

mod memory;
mod omap;

pub use memory::MemoryStore;
pub use omap::{OmapStore, VOLUMES_OBJECT};

use async_trait::async_trait;

use crate::error::{Result, VolumeError};
use crate::types::{ListFilter, Volume};

/// Key-value persistence of volume records.
///
/// A single `put` is atomic per key. No ordering is guaranteed by `list`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the record stored under `record.id`.
    async fn put(&self, record: &Volume) -> Result<()>;

    /// Fetch a record. A missing key is `Ok(None)`.
    async fn get(&self, id: &str) -> Result<Option<Volume>>;

    /// Remove a record. Removing a missing key succeeds.
    async fn delete(&self, id: &str) -> Result<()>;

    /// List the records passing `filter`.
    ///
    /// A record that cannot be decoded fails the whole call with
    /// `CorruptMetadata`.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Volume>>;
}

/// Serialize a record into its stored form.
pub(crate) fn encode(record: &Volume) -> Result<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|e| VolumeError::Internal(format!("failed to encode volume {}: {}", record.id, e)))
}

/// Decode a stored value, checking it belongs to `id`.
pub(crate) fn decode(id: &str, data: &[u8]) -> Result<Volume> {
    let volume: Volume = serde_json::from_slice(data).map_err(|e| VolumeError::CorruptMetadata {
        id: id.to_string(),
        reason: e.to_string(),
    })?;

    if volume.id != id {
        return Err(VolumeError::CorruptMetadata {
            id: id.to_string(),
            reason: format!("record is keyed as {} but carries id {}", id, volume.id),
        });
    }

    Ok(volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeSpec;

    #[test]
    fn test_decode_rejects_mismatched_id() {
        let volume = Volume::pending(&VolumeSpec::new("vol-1", "fast", 1), None);
        let data = encode(&volume).unwrap();

        assert_eq!(decode("vol-1", &data).unwrap(), volume);
        assert!(matches!(
            decode("vol-2", &data),
            Err(VolumeError::CorruptMetadata { ref id, .. }) if id == "vol-2"
        ));
        assert!(matches!(
            decode("vol-1", b"{\"id\":"),
            Err(VolumeError::CorruptMetadata { .. })
        ));
    }
}
