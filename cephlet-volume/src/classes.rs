//! The supported volume classes.
//!
//! Loaded once at startup from a JSON list and shared read-only afterwards:
//!
//! ```json
//! [{"name": "fast", "capabilities": {"tps": 100, "iops": 100}}]
//! ```

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::error::{Result, VolumeError};
use crate::types::VolumeClass;

/// Immutable, ordered set of configured volume classes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeClassSet {
    classes: Vec<VolumeClass>,
}

impl VolumeClassSet {
    /// Build a set, rejecting empty and duplicate names.
    pub fn new(classes: Vec<VolumeClass>) -> Result<Self> {
        let mut seen = HashSet::new();
        for class in &classes {
            if class.name.is_empty() {
                return Err(VolumeError::InvalidArgument(
                    "volume class name must not be empty".into(),
                ));
            }
            if !seen.insert(class.name.as_str()) {
                return Err(VolumeError::InvalidArgument(format!(
                    "duplicate volume class {}",
                    class.name
                )));
            }
        }
        Ok(Self { classes })
    }

    /// Parse a JSON document.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let classes: Vec<VolumeClass> = serde_json::from_slice(data).map_err(|e| {
            VolumeError::InvalidArgument(format!("failed to parse volume classes: {}", e))
        })?;
        Self::new(classes)
    }

    /// Load the classes file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            VolumeError::InvalidArgument(format!(
                "failed to read volume classes {}: {}",
                path.display(),
                e
            ))
        })?;
        let set = Self::from_json(&data)?;
        info!(
            path = %path.display(),
            classes = ?set.names().collect::<Vec<_>>(),
            "Volume classes loaded"
        );
        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<&VolumeClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Classes in configured order.
    pub fn as_slice(&self) -> &[VolumeClass] {
        &self.classes
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_keeps_order() {
        let json = br#"[
            {"name": "slow", "capabilities": {"tps": 10, "iops": 10}},
            {"name": "fast", "capabilities": {"tps": 100, "iops": 100}}
        ]"#;
        let set = VolumeClassSet::from_json(json).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["slow", "fast"]);
        assert_eq!(set.get("fast").unwrap().capabilities.iops, 100);
        assert!(!set.contains("medium"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = VolumeClassSet::new(vec![
            VolumeClass::new("foo", 1, 1),
            VolumeClass::new("foo", 2, 2),
        ]);
        assert!(matches!(result, Err(VolumeError::InvalidArgument(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"name":"foo","capabilities":{"tps":100,"iops":100}}]"#)
            .unwrap();

        let set = VolumeClassSet::load(file.path()).unwrap();
        assert_eq!(set.as_slice(), &[VolumeClass::new("foo", 100, 100)]);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(VolumeClassSet::load("/nonexistent/classes.json").is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(VolumeClassSet::from_json(b"{not json").is_err());
    }
}
