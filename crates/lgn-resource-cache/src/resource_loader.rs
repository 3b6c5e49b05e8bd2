use std::sync::Arc;

use log::error;

use crate::{
    loading::CancellationToken, resource_cache::CacheShared, vfs::Device, Error, HandleUntyped,
    MemoryUsage, Priority, Resource, ResourceId, ResourceType, Result,
};

/// An interface allowing to load and install resources of a type.
///
/// `load_data` runs on a background worker without the cache lock and must
/// not touch other resources. `update_content` turns the loaded bytes into the
/// final resource and may acquire other resources through the
/// [`UpdateContext`], subject to the declared nested-acquire permissions.
pub trait ResourceLoader: Send + Sync {
    /// Data load stage: produce the raw bytes of a resource.
    fn load_data(&self, request: &LoadRequest<'_>) -> Result<Vec<u8>>;

    /// Update content stage: consume the bytes into the resource.
    fn update_content(
        &self,
        resource: &mut dyn Resource,
        data: &mut Vec<u8>,
        context: &mut UpdateContext<'_>,
    ) -> Result<()>;

    /// Memory footprint of an updated resource. Must report an estimate for
    /// every resource it updated.
    fn estimate_memory_usage(&self, resource: &dyn Resource) -> Option<MemoryUsage>;

    /// Installs default content after a failed load. Returns true if a
    /// fallback was installed.
    fn apply_fallback(&self, _resource: &mut dyn Resource) -> bool {
        false
    }
}

/// Context of a data load.
pub struct LoadRequest<'a> {
    pub(crate) id: &'a ResourceId,
    pub(crate) resource_type: ResourceType,
    pub(crate) type_name: &'a str,
    pub(crate) reload: bool,
    pub(crate) devices: &'a [Arc<dyn Device>],
    pub(crate) token: &'a CancellationToken,
}

impl<'a> LoadRequest<'a> {
    /// Id of the resource being loaded.
    pub fn id(&self) -> &ResourceId {
        self.id
    }

    /// Effective type of the resource being loaded.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Name of the effective type.
    pub fn type_name(&self) -> &str {
        self.type_name
    }

    /// True if the resource was already loaded and is being reloaded.
    pub fn is_reload(&self) -> bool {
        self.reload
    }

    /// Cooperative cancellation; long loads should poll this and bail out.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reads the resource from the first device that has it.
    pub fn read_source(&self) -> Result<Vec<u8>> {
        self.devices
            .iter()
            .find_map(|device| device.load(self.type_name, self.id))
            .ok_or_else(|| Error::LoadFailed {
                id: self.id.clone(),
                reason: "not found on any device".to_owned(),
            })
    }
}

/// Kind of data an update consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataQuality {
    /// Cheap partial representation applied ahead of the full load.
    LowResolution,
    /// Final data of a full load.
    Full,
}

/// Context of a content update.
pub struct UpdateContext<'a> {
    shared: &'a CacheShared,
    updating: ResourceType,
    quality: DataQuality,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn new(
        shared: &'a CacheShared,
        updating: ResourceType,
        quality: DataQuality,
    ) -> Self {
        Self {
            shared,
            updating,
            quality,
        }
    }

    /// Type of the resource being updated.
    pub fn resource_type(&self) -> ResourceType {
        self.updating
    }

    /// Kind of data being applied.
    pub fn quality(&self) -> DataQuality {
        self.quality
    }

    /// Acquires another resource from within the update.
    ///
    /// # Errors
    /// `Error::MisconfiguredPermission` if the updated type was never allowed
    /// to acquire the effective type of the requested resource.
    pub fn acquire(
        &mut self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
        priority: Priority,
    ) -> Result<HandleUntyped> {
        self.shared
            .acquire_nested(self.updating, resource_type, id.into(), priority)
            .map_err(|err| {
                if matches!(err, Error::MisconfiguredPermission { .. }) {
                    error!("{}", err);
                }
                err
            })
    }

    /// Same as [`Self::acquire`], then loads the resource synchronously.
    pub fn acquire_loaded(
        &mut self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
    ) -> Result<HandleUntyped> {
        let handle = self.acquire(resource_type, id, Priority::Critical)?;
        self.shared.force_load_now(&handle);
        Ok(handle)
    }
}
