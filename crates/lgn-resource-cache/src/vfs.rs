//! Sources of raw resource data.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
};

use parking_lot::RwLock;

use crate::ResourceId;

/// A device able to provide the raw bytes of a resource.
pub trait Device: Send + Sync {
    /// Bytes of the resource, `None` if this device does not have it.
    fn load(&self, type_name: &str, id: &ResourceId) -> Option<Vec<u8>>;
}

/// In-memory device. Content can be replaced at any time, which is how
/// reloads pick up new data.
#[derive(Default)]
pub struct MemoryDevice {
    content: RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemoryDevice {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the content of a resource.
    pub fn insert(&self, id: impl Into<ResourceId>, content: impl Into<Vec<u8>>) {
        self.content
            .write()
            .insert(id.into().hash_value(), content.into());
    }

    /// Removes the content of a resource, returning it.
    pub fn remove(&self, id: impl Into<ResourceId>) -> Option<Vec<u8>> {
        self.content.write().remove(&id.into().hash_value())
    }
}

impl Device for MemoryDevice {
    fn load(&self, _type_name: &str, id: &ResourceId) -> Option<Vec<u8>> {
        self.content.read().get(&id.hash_value()).cloned()
    }
}

/// Directory storage device. Resources are stored in files named by their ids.
///
/// Ids are relative paths below the directory; ids escaping it are not found.
pub struct DirDevice {
    dir: PathBuf,
}

impl DirDevice {
    /// Creates a device reading from the directory at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            dir: path.as_ref().to_owned(),
        }
    }
}

impl Device for DirDevice {
    fn load(&self, _type_name: &str, id: &ResourceId) -> Option<Vec<u8>> {
        let relative = Path::new(id.as_str());
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        std::fs::read(self.dir.join(relative)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device() {
        let device = MemoryDevice::new();
        assert!(device.load("text", &ResourceId::new("a")).is_none());
        device.insert("a", b"child".to_vec());
        assert_eq!(device.load("text", &ResourceId::new("a")).unwrap(), b"child");
        device.remove("a");
        assert!(device.load("text", &ResourceId::new("a")).is_none());
    }

    #[test]
    fn dir_device() {
        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(work_dir.path().join("sky.png"), b"pixels").unwrap();

        let device = DirDevice::new(work_dir.path());
        assert_eq!(device.load("texture", &ResourceId::new("sky.png")).unwrap(), b"pixels");
        assert!(device.load("texture", &ResourceId::new("missing.png")).is_none());
    }

    #[test]
    fn dir_device_stays_in_its_directory() {
        let work_dir = tempfile::tempdir().unwrap();
        let inner = work_dir.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(work_dir.path().join("secret"), b"hidden").unwrap();
        std::fs::write(inner.join("sky.png"), b"pixels").unwrap();

        let device = DirDevice::new(&inner);
        let absolute = work_dir.path().join("secret");
        assert!(device
            .load("texture", &ResourceId::new(absolute.to_string_lossy()))
            .is_none());
        assert!(device.load("texture", &ResourceId::new("../secret")).is_none());
        assert_eq!(
            device.load("texture", &ResourceId::new("./sky.png")).unwrap(),
            b"pixels"
        );
    }
}
