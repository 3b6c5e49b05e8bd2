use std::{fmt, sync::Arc};

use smallvec::SmallVec;

use crate::{Error, Priority, Resource, ResourceLoader, Result};

/// Id of a registered resource type.
///
/// Assigned in registration order by [`crate::ResourceCacheOptions`]; the
/// ordering is used to lay out the registry so that all resources of a type
/// are contiguous.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceType(u32);

impl ResourceType {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Constructs empty instances of a resource type.
pub type ResourceAllocator =
    Arc<dyn Fn() -> std::result::Result<Box<dyn Resource>, String> + Send + Sync>;

/// Description of a resource kind.
///
/// Immutable once handed to [`crate::ResourceCacheOptions::add_resource_type`].
pub struct ResourceTypeDescriptor {
    name: String,
    parent: Option<ResourceType>,
    allocator: ResourceAllocator,
    loader: Option<Arc<dyn ResourceLoader>>,
    default_priority: Priority,
    incremental_unload: bool,
    reloadable: bool,
}

impl ResourceTypeDescriptor {
    /// Descriptor whose allocator builds `T::default()`.
    pub fn new<T: Resource + Default>(name: impl Into<String>) -> Self {
        Self::with_allocator(name, || Ok(Box::new(T::default()) as Box<dyn Resource>))
    }

    /// Descriptor with a custom allocator.
    pub fn with_allocator<F>(name: impl Into<String>, allocator: F) -> Self
    where
        F: Fn() -> std::result::Result<Box<dyn Resource>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            parent: None,
            allocator: Arc::new(allocator),
            loader: None,
            default_priority: Priority::Medium,
            incremental_unload: false,
            reloadable: true,
        }
    }

    /// Makes this type derive from `parent`.
    #[must_use]
    pub fn with_parent(mut self, parent: ResourceType) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Loader used for this type. Types without a loader use their nearest
    /// ancestor's.
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Priority assigned to new resources of this type.
    #[must_use]
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Allows the incremental sweep to visit resources of this type.
    #[must_use]
    pub fn with_incremental_unload(mut self, eligible: bool) -> Self {
        self.incremental_unload = eligible;
        self
    }

    /// Whether resources of this type may be reloaded.
    #[must_use]
    pub fn with_reloadable(mut self, reloadable: bool) -> Self {
        self.reloadable = reloadable;
        self
    }

    /// Name of the type, unique within a cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type this one derives from.
    pub fn parent(&self) -> Option<ResourceType> {
        self.parent
    }

    /// Priority of requests that do not specify one.
    pub fn default_priority(&self) -> Priority {
        self.default_priority
    }

    /// Whether the incremental sweep visits resources of this type.
    pub fn is_incremental_unload_eligible(&self) -> bool {
        self.incremental_unload
    }

    /// Whether resources of this type accept reloads and low-resolution data.
    pub fn is_reloadable(&self) -> bool {
        self.reloadable
    }

    pub(crate) fn allocate(&self) -> std::result::Result<Box<dyn Resource>, String> {
        (self.allocator)()
    }
}

impl fmt::Debug for ResourceTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTypeDescriptor")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("default_priority", &self.default_priority)
            .field("incremental_unload", &self.incremental_unload)
            .field("reloadable", &self.reloadable)
            .finish()
    }
}

struct RegisteredType {
    descriptor: ResourceTypeDescriptor,
    /// Nearest first, excluding the type itself.
    ancestors: SmallVec<[ResourceType; 4]>,
    /// Every type deriving from this one, transitively.
    descendants: Vec<ResourceType>,
}

/// The type hierarchy. Parent links are resolved once at registration.
#[derive(Default)]
pub(crate) struct TypeTable {
    types: Vec<RegisteredType>,
}

impl TypeTable {
    pub(crate) fn add(&mut self, descriptor: ResourceTypeDescriptor) -> Result<ResourceType> {
        let ty = ResourceType::from_index(self.types.len());

        let mut ancestors: SmallVec<[ResourceType; 4]> = SmallVec::new();
        if let Some(parent) = descriptor.parent {
            let parent_entry = self
                .types
                .get(parent.index())
                .ok_or_else(|| Error::UnknownResourceType(parent.to_string()))?;
            ancestors.push(parent);
            ancestors.extend(parent_entry.ancestors.iter().copied());
        }

        for ancestor in &ancestors {
            self.types[ancestor.index()].descendants.push(ty);
        }

        self.types.push(RegisteredType {
            descriptor,
            ancestors,
            descendants: Vec::new(),
        });
        Ok(ty)
    }

    pub(crate) fn descriptor(&self, ty: ResourceType) -> &ResourceTypeDescriptor {
        &self.types[ty.index()].descriptor
    }

    pub(crate) fn contains(&self, ty: ResourceType) -> bool {
        ty.index() < self.types.len()
    }

    pub(crate) fn name(&self, ty: ResourceType) -> &str {
        self.descriptor(ty).name()
    }

    pub(crate) fn ancestors(&self, ty: ResourceType) -> &[ResourceType] {
        &self.types[ty.index()].ancestors
    }

    pub(crate) fn descendants(&self, ty: ResourceType) -> &[ResourceType] {
        &self.types[ty.index()].descendants
    }

    /// `ty` itself followed by its ancestors, nearest first.
    pub(crate) fn lineage(&self, ty: ResourceType) -> impl Iterator<Item = ResourceType> + '_ {
        std::iter::once(ty).chain(self.ancestors(ty).iter().copied())
    }

    pub(crate) fn is_derived_from(&self, ty: ResourceType, base: ResourceType) -> bool {
        ty == base || self.ancestors(ty).contains(&base)
    }

    pub(crate) fn loader(&self, ty: ResourceType) -> Option<Arc<dyn ResourceLoader>> {
        self.lineage(ty)
            .find_map(|ty| self.descriptor(ty).loader.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.types.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ResourceType> {
        (0..self.types.len()).map(ResourceType::from_index)
    }
}
