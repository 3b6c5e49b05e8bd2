use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::{registry::ResourceKey, LoadingState, Resource, ResourceId, ResourceType};

/// Read access to the content of a resource.
pub type ResourceGuard<'a, T> = MappedRwLockReadGuard<'a, T>;

//
//
//

/// Storage of a resource, exclusively owned by its registry entry.
///
/// Handles and in-flight load jobs only ever alias it through an `Arc`.
pub(crate) struct ResourceSlot {
    pub(crate) key: ResourceKey,
    pub(crate) resource_type: ResourceType,
    pub(crate) type_name: Arc<str>,
    pub(crate) id: ResourceId,
    ref_count: AtomicU32,
    state: AtomicU8,
    pub(crate) content: RwLock<Box<dyn Resource>>,
}

impl ResourceSlot {
    pub(crate) fn new(
        key: ResourceKey,
        resource_type: ResourceType,
        type_name: Arc<str>,
        id: ResourceId,
        content: Box<dyn Resource>,
    ) -> Self {
        Self {
            key,
            resource_type,
            type_name,
            id,
            ref_count: AtomicU32::new(0),
            state: AtomicU8::new(LoadingState::Unloaded as u8),
            content: RwLock::new(content),
        }
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> LoadingState {
        LoadingState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LoadingState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

//
//
//

/// Type-less version of [`Handle`].
///
/// Every live handle contributes one to the reference count of its resource;
/// a resource is only evicted once all its handles are dropped.
pub struct HandleUntyped {
    slot: Arc<ResourceSlot>,
}

impl HandleUntyped {
    /// Only called with the cache lock held, which makes the 0 -> 1
    /// transition of the count visible to eviction atomically.
    pub(crate) fn new(slot: Arc<ResourceSlot>) -> Self {
        slot.ref_count.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }

    pub(crate) fn slot(&self) -> &Arc<ResourceSlot> {
        &self.slot
    }

    pub(crate) fn key(&self) -> ResourceKey {
        self.slot.key
    }

    /// Retrieve the content of the resource as `T`.
    ///
    /// Returns `None` if the effective type of the resource is not backed by
    /// `T`. Blocks while a content update is in progress.
    pub fn get<T: Resource>(&self) -> Option<ResourceGuard<'_, T>> {
        RwLockReadGuard::try_map(self.slot.content.read(), |content| {
            content.downcast_ref::<T>()
        })
        .ok()
    }

    /// Id of the resource.
    pub fn id(&self) -> &ResourceId {
        &self.slot.id
    }

    /// Effective type of the resource, after override resolution.
    pub fn resource_type(&self) -> ResourceType {
        self.slot.resource_type
    }

    /// Name of the effective type.
    pub fn type_name(&self) -> &str {
        &self.slot.type_name
    }

    /// Current loading state.
    pub fn loading_state(&self) -> LoadingState {
        self.slot.state()
    }

    /// Returns true if the load finished and succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loading_state() == LoadingState::Loaded
    }

    /// Returns true if the load finished without producing data.
    pub fn is_err(&self) -> bool {
        self.loading_state() == LoadingState::LoadedResourceMissing
    }

    /// Number of outstanding handles to the resource.
    pub fn ref_count(&self) -> u32 {
        self.slot.ref_count()
    }

    /// Explicitly releases the handle. Same as dropping it.
    pub fn release(self) {}

    /// Converts into a handle typed over `T`.
    pub fn typed<T: Resource>(self) -> Handle<T> {
        Handle::from(self)
    }
}

impl Clone for HandleUntyped {
    fn clone(&self) -> Self {
        self.slot.ref_count.fetch_add(1, Ordering::AcqRel);
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl Drop for HandleUntyped {
    fn drop(&mut self) {
        let previous = self.slot.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "reference count underflow on {}", self.slot.id);
    }
}

/// Handles are equal when they refer to the same resource instance.
impl PartialEq for HandleUntyped {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Eq for HandleUntyped {}

impl fmt::Debug for HandleUntyped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleUntyped")
            .field("type", &self.type_name())
            .field("id", &self.slot.id)
            .field("state", &self.loading_state())
            .finish()
    }
}

//
//
//

/// Typed handle to a [`Resource`] of type `T`.
pub struct Handle<T: Resource> {
    untyped: HandleUntyped,
    _pd: PhantomData<fn() -> T>,
}

impl<T: Resource> Handle<T> {
    /// Retrieve the content of the resource.
    pub fn get(&self) -> Option<ResourceGuard<'_, T>> {
        self.untyped.get::<T>()
    }

    /// Access the type-less handle.
    pub fn untyped(&self) -> &HandleUntyped {
        &self.untyped
    }

    /// Id of the resource.
    pub fn id(&self) -> &ResourceId {
        self.untyped.id()
    }

    /// Effective type of the resource.
    pub fn resource_type(&self) -> ResourceType {
        self.untyped.resource_type()
    }

    /// Current loading state.
    pub fn loading_state(&self) -> LoadingState {
        self.untyped.loading_state()
    }

    /// Returns true if the load finished and succeeded.
    pub fn is_loaded(&self) -> bool {
        self.untyped.is_loaded()
    }

    /// Returns true if the load finished without producing data.
    pub fn is_err(&self) -> bool {
        self.untyped.is_err()
    }

    /// Number of outstanding handles to the resource.
    pub fn ref_count(&self) -> u32 {
        self.untyped.ref_count()
    }
}

impl<T: Resource> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            untyped: self.untyped.clone(),
            _pd: PhantomData,
        }
    }
}

impl<T: Resource> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.untyped == other.untyped
    }
}

impl<T: Resource> From<HandleUntyped> for Handle<T> {
    fn from(untyped: HandleUntyped) -> Self {
        Self {
            untyped,
            _pd: PhantomData,
        }
    }
}

impl<T: Resource> From<Handle<T>> for HandleUntyped {
    fn from(handle: Handle<T>) -> Self {
        handle.untyped
    }
}

impl<T: Resource> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.untyped.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;
    use crate::test_resource::TestResource;

    fn slot() -> Arc<ResourceSlot> {
        let mut keys = SlotMap::<ResourceKey, ()>::with_key();
        Arc::new(ResourceSlot::new(
            keys.insert(()),
            ResourceType::from_index(0),
            Arc::from("test_resource"),
            ResourceId::new("a"),
            Box::new(TestResource::default()),
        ))
    }

    #[test]
    fn ref_count() {
        let slot = slot();
        {
            let a = HandleUntyped::new(slot.clone());
            assert_eq!(a.ref_count(), 1);
            {
                let b = a.clone();
                assert_eq!(b.ref_count(), 2);
                assert_eq!(a, b);
            }
            assert_eq!(a.ref_count(), 1);
        }
        assert_eq!(slot.ref_count(), 0);
    }

    #[test]
    fn typed_ref() {
        let slot = slot();
        let untyped = HandleUntyped::new(slot.clone());
        let typed: Handle<TestResource> = untyped.typed();
        assert_eq!(typed.ref_count(), 1);
        assert_eq!(typed.get().unwrap().content, "");

        let back: HandleUntyped = typed.clone().into();
        assert_eq!(back.ref_count(), 2);
        drop(typed);
        drop(back);
        assert_eq!(slot.ref_count(), 0);
    }

    #[test]
    fn state_is_visible_through_handles() {
        let slot = slot();
        let handle = HandleUntyped::new(slot.clone());
        assert_eq!(handle.loading_state(), LoadingState::Unloaded);
        slot.set_state(LoadingState::LoadedResourceMissing);
        assert!(handle.is_err());
        assert!(!handle.is_loaded());
    }
}
