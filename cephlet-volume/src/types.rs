//! Core types for volume management.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VolumeError};

/// Label carrying the volume class, set on the record and on the backing image.
pub const CLASS_LABEL: &str = "volume.cephlet.io/class";

/// Secret keys attached to the access information of an available volume.
pub const SECRET_USER_ID: &str = "userID";
pub const SECRET_USER_KEY: &str = "userKey";
pub const SECRET_ENCRYPTION_KEY: &str = "encryptionKey";

// =============================================================================
// Volume classes
// =============================================================================

/// Capability hints of a volume class. Opaque to the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClassCapabilities {
    #[serde(default)]
    pub tps: u64,
    #[serde(default)]
    pub iops: u64,
}

/// A named tier of service that callers select at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClass {
    pub name: String,
    #[serde(default)]
    pub capabilities: VolumeClassCapabilities,
}

impl VolumeClass {
    pub fn new(name: impl Into<String>, tps: u64, iops: u64) -> Self {
        Self {
            name: name.into(),
            capabilities: VolumeClassCapabilities { tps, iops },
        }
    }
}

// =============================================================================
// Volume state
// =============================================================================

/// Lifecycle state of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// Record persisted, backing image not provisioned yet.
    Pending,
    /// Backing image exists, access information is populated.
    Available,
    /// Provisioning failed.
    Error,
    /// Deletion in progress.
    Deleting,
}

impl VolumeState {
    /// Whether a record in this state may move to `next`.
    ///
    /// Staying in the same state is always allowed (size updates, retries).
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        use VolumeState::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Available)
                    | (Pending, Error)
                    | (Pending, Deleting)
                    | (Available, Error)
                    | (Available, Deleting)
                    | (Error, Deleting)
            )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Pending => write!(f, "pending"),
            VolumeState::Available => write!(f, "available"),
            VolumeState::Error => write!(f, "error"),
            VolumeState::Deleting => write!(f, "deleting"),
        }
    }
}

// =============================================================================
// Volume record
// =============================================================================

/// Reference to the wrapped data encryption key of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRef {
    #[serde(with = "base64_bytes")]
    pub wrapped_dek: Vec<u8>,
}

/// How a consumer reaches the backing image of an available volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAccess {
    pub driver: String,
    pub handle: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Attached on read, never persisted.
    #[serde(skip)]
    pub secret_data: HashMap<String, Vec<u8>>,
}

/// Desired volume as requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub id: String,
    pub class_name: String,
    pub size_bytes: u64,
    pub image: Option<String>,
    pub encryption: bool,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl VolumeSpec {
    /// Create a spec for a plain, unencrypted volume.
    pub fn new(id: impl Into<String>, class_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            class_name: class_name.into(),
            size_bytes,
            image: None,
            encryption: false,
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    /// Clone the volume from a source image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Request at-rest encryption.
    pub fn with_encryption(mut self) -> Self {
        self.encryption = true;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(VolumeError::InvalidArgument("volume id must not be empty".into()));
        }
        if self.class_name.is_empty() {
            return Err(VolumeError::InvalidArgument("volume class must not be empty".into()));
        }
        if self.size_bytes == 0 {
            return Err(VolumeError::InvalidArgument(
                "volume size must be greater than 0".into(),
            ));
        }
        if matches!(self.image.as_deref(), Some("")) {
            return Err(VolumeError::InvalidArgument("source image must not be empty".into()));
        }
        Ok(())
    }
}

/// The persisted volume record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    /// Distinguishes records reusing the ID of a deleted volume
    #[serde(default)]
    pub uid: String,
    pub class_name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionRef>,
    pub state: VolumeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<VolumeAccess>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Why provisioning failed. Diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub generation: i64,
}

impl Volume {
    /// Build the initial `Pending` record for a spec.
    pub fn pending(spec: &VolumeSpec, encryption: Option<EncryptionRef>) -> Self {
        let mut labels = spec.labels.clone();
        labels.insert(CLASS_LABEL.to_string(), spec.class_name.clone());

        Self {
            id: spec.id.clone(),
            uid: Uuid::new_v4().to_string(),
            class_name: spec.class_name.clone(),
            size_bytes: spec.size_bytes,
            image_ref: spec.image.clone(),
            encryption,
            state: VolumeState::Pending,
            access: None,
            labels,
            annotations: spec.annotations.clone(),
            error_reason: None,
            created_at: Utc::now(),
            generation: 1,
        }
    }

    /// Whether a repeated create with `spec` is the same request.
    ///
    /// Class, size, source image and whether encryption was requested take
    /// part; labels and annotations do not.
    pub fn matches_spec(&self, spec: &VolumeSpec) -> bool {
        self.class_name == spec.class_name
            && self.size_bytes == spec.size_bytes
            && self.image_ref == spec.image
            && self.encryption.is_some() == spec.encryption
    }

    /// Move the record to `next`, keeping the access invariant.
    pub fn transition(&mut self, next: VolumeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VolumeError::InvalidState(format!(
                "volume {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next != VolumeState::Available {
            self.access = None;
        }
        if next != VolumeState::Error {
            self.error_reason = None;
        }
        self.generation += 1;
        Ok(())
    }

    /// Mark the volume available with the given access information.
    pub fn mark_available(&mut self, access: VolumeAccess) -> Result<()> {
        self.transition(VolumeState::Available)?;
        self.access = Some(access);
        Ok(())
    }

    /// Mark the volume failed, recording the reason.
    pub fn mark_error(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(VolumeState::Error)?;
        self.error_reason = Some(reason.into());
        Ok(())
    }
}

// =============================================================================
// Filtering
// =============================================================================

/// Filter for listing volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Exact volume ID. Yields at most one record.
    pub id: Option<String>,
    /// Volume ID prefix.
    pub id_prefix: Option<String>,
    /// Every listed label must be present with the same value.
    pub labels: HashMap<String, String>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn by_prefix(prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether `volume` passes this filter.
    pub fn matches(&self, volume: &Volume) -> bool {
        if let Some(ref id) = self.id {
            if &volume.id != id {
                return false;
            }
        }
        if let Some(ref prefix) = self.id_prefix {
            if !volume.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| volume.labels.get(k) == Some(v))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VolumeSpec {
        VolumeSpec::new("vol-1", "fast", 1024)
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().validate().is_ok());
        assert!(matches!(
            VolumeSpec::new("", "fast", 1).validate(),
            Err(VolumeError::InvalidArgument(_))
        ));
        assert!(matches!(
            VolumeSpec::new("vol", "fast", 0).validate(),
            Err(VolumeError::InvalidArgument(_))
        ));
        assert!(spec().with_image("").validate().is_err());
    }

    #[test]
    fn test_pending_record_carries_class_label() {
        let volume = Volume::pending(&spec().with_label("team", "storage"), None);
        assert_eq!(volume.state, VolumeState::Pending);
        assert!(volume.access.is_none());
        assert_eq!(volume.labels.get(CLASS_LABEL).map(String::as_str), Some("fast"));
        assert_eq!(volume.labels.get("team").map(String::as_str), Some("storage"));
    }

    #[test]
    fn test_each_record_gets_its_own_uid() {
        let first = Volume::pending(&spec(), None);
        let second = Volume::pending(&spec(), None);
        assert!(!first.uid.is_empty());
        assert_ne!(first.uid, second.uid);

        // Records written before the uid existed still decode
        let mut json = serde_json::to_value(&first).unwrap();
        json.as_object_mut().unwrap().remove("uid");
        let decoded: Volume = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.uid, "");
    }

    #[test]
    fn test_matches_spec() {
        let volume = Volume::pending(&spec(), None);
        assert!(volume.matches_spec(&spec()));
        assert!(volume.matches_spec(&spec().with_label("ignored", "yes")));
        assert!(!volume.matches_spec(&VolumeSpec::new("vol-1", "fast", 2048)));
        assert!(!volume.matches_spec(&VolumeSpec::new("vol-1", "slow", 1024)));
        assert!(!volume.matches_spec(&spec().with_encryption()));
        assert!(!volume.matches_spec(&spec().with_image("ubuntu")));
    }

    #[test]
    fn test_transitions() {
        let mut volume = Volume::pending(&spec(), None);
        volume
            .mark_available(VolumeAccess {
                driver: "ceph".into(),
                handle: "pool/vol-1".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(volume.state, VolumeState::Available);
        assert!(volume.access.is_some());

        // Pending is never re-entered
        assert!(volume.transition(VolumeState::Pending).is_err());

        volume.transition(VolumeState::Deleting).unwrap();
        assert!(volume.access.is_none());
        assert!(volume.transition(VolumeState::Available).is_err());
    }

    #[test]
    fn test_error_reason_is_kept_only_in_error() {
        let mut volume = Volume::pending(&spec(), None);
        volume.mark_error("rbd create failed").unwrap();
        assert_eq!(volume.error_reason.as_deref(), Some("rbd create failed"));

        volume.transition(VolumeState::Deleting).unwrap();
        assert!(volume.error_reason.is_none());
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let mut volume = Volume::pending(&spec(), Some(EncryptionRef { wrapped_dek: vec![1, 2, 3] }));
        let mut access = VolumeAccess::default();
        access.secret_data.insert(SECRET_USER_KEY.into(), b"secret".to_vec());
        volume.mark_available(access).unwrap();

        let json = serde_json::to_string(&volume).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("AQID"));

        let decoded: Volume = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.encryption, volume.encryption);
        assert!(decoded.access.unwrap().secret_data.is_empty());
    }

    #[test]
    fn test_list_filter() {
        let volume = Volume::pending(&VolumeSpec::new("team-a-1", "fast", 1), None);
        assert!(ListFilter::all().matches(&volume));
        assert!(ListFilter::by_id("team-a-1").matches(&volume));
        assert!(!ListFilter::by_id("team-a").matches(&volume));
        assert!(ListFilter::by_prefix("team-a").matches(&volume));
        assert!(!ListFilter::by_prefix("team-b").matches(&volume));
        assert!(ListFilter::all().with_label(CLASS_LABEL, "fast").matches(&volume));
        assert!(!ListFilter::all().with_label(CLASS_LABEL, "slow").matches(&volume));
    }
}
