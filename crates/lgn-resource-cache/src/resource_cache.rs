use std::{
    collections::HashMap,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    events::{EventDispatcher, ResourceEvent, ResourceInfo, SubscriptionId},
    loading::CancellationToken,
    loading_queue::LoadingQueue,
    permissions::PermissionGraph,
    registry::{Registry, RegistryPosition, ResourceKey},
    resource_type::TypeTable,
    type_resolution::TypeResolution,
    vfs::Device,
    Error, Handle, HandleUntyped, LeakedResource, LoadingState, MemoryUsage, Priority, Resource,
    ResourceCacheConfig, ResourceFlags, ResourceId, ResourceType, ResourceTypeDescriptor, Result,
};

/// Mutable state of the cache, guarded by the cache lock.
pub(crate) struct CacheState {
    pub(crate) registry: Registry,
    pub(crate) queue: LoadingQueue,
    /// Single owner of a resource's content: a running load, a low-resolution
    /// update or an unload.
    pub(crate) in_flight: HashMap<ResourceKey, CancellationToken>,
    pub(crate) resolution: TypeResolution,
    pub(crate) permissions: PermissionGraph,
    pub(crate) events: EventDispatcher,
    /// Incremental sweep position.
    pub(crate) cursor: Option<RegistryPosition>,
    pub(crate) accepting_loads: bool,
    pub(crate) terminate_workers: bool,
    shutting_down: bool,
}

impl CacheState {
    fn new() -> Self {
        Self {
            registry: Registry::default(),
            queue: LoadingQueue::default(),
            in_flight: HashMap::new(),
            resolution: TypeResolution::default(),
            permissions: PermissionGraph::default(),
            events: EventDispatcher::default(),
            cursor: None,
            accepting_loads: true,
            terminate_workers: false,
            shutting_down: false,
        }
    }

    /// Applies named redirects then type overrides.
    fn resolve(
        &self,
        types: &TypeTable,
        max_steps: u32,
        requested: ResourceType,
        id: ResourceId,
    ) -> (ResourceType, ResourceId) {
        let id = self.resolution.resolve_id(id);
        let effective = self
            .resolution
            .resolve_type(types, requested, id.as_str(), max_steps);
        (effective, id)
    }

    /// Returns a handle to the resource serving (type, id), creating it
    /// `Unloaded` if needed. Never loads.
    pub(crate) fn get_or_create(
        &mut self,
        types: &TypeTable,
        max_steps: u32,
        requested: ResourceType,
        id: ResourceId,
    ) -> Result<HandleUntyped> {
        let (effective, id) = self.resolve(types, max_steps, requested, id);
        let key = match self.registry.lookup(effective, &id) {
            Some(key) => key,
            None => self.registry.insert(types, effective, id)?,
        };
        self.registry
            .acquire(key, Instant::now())
            .ok_or_else(|| Error::UnknownResourceType(types.name(effective).to_owned()))
    }

    pub(crate) fn get_existing(
        &mut self,
        types: &TypeTable,
        max_steps: u32,
        requested: ResourceType,
        id: ResourceId,
    ) -> Option<HandleUntyped> {
        let (effective, id) = self.resolve(types, max_steps, requested, id);
        let key = self.registry.lookup(effective, &id)?;
        self.registry.acquire(key, Instant::now())
    }

    fn loaded_resources(&self) -> Vec<ResourceInfo> {
        self.registry
            .records()
            .filter(|(_, record)| record.slot.state() == LoadingState::Loaded)
            .map(|(_, record)| ResourceInfo::from_slot(&record.slot))
            .collect()
    }
}

type CleanupCallback = Box<dyn FnOnce(&ResourceCache) + Send>;

#[derive(Default)]
struct CleanupCallbacks {
    pending: Vec<CleanupCallback>,
    closed: bool,
}

/// State shared between the cache and its loading threads.
pub(crate) struct CacheShared {
    pub(crate) types: TypeTable,
    pub(crate) devices: Vec<Arc<dyn Device>>,
    pub(crate) config: ResourceCacheConfig,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) work_available: Condvar,
    pub(crate) load_completed: Condvar,
}

impl CacheShared {
    fn check_type(&self, resource_type: ResourceType) -> Result<()> {
        if self.types.contains(resource_type) {
            Ok(())
        } else {
            Err(Error::UnknownResourceType(resource_type.to_string()))
        }
    }

    fn acquire(
        &self,
        resource_type: ResourceType,
        id: ResourceId,
        priority: Option<Priority>,
    ) -> Result<HandleUntyped> {
        self.check_type(resource_type)?;
        let mut state = self.state.lock();
        if !state.accepting_loads {
            return Err(Error::ShuttingDown);
        }
        let handle = state.get_or_create(
            &self.types,
            self.config.max_override_steps,
            resource_type,
            id,
        )?;
        let priority = priority.unwrap_or_else(|| {
            self.types
                .descriptor(handle.resource_type())
                .default_priority()
        });
        if state.enqueue(handle.key(), priority, false) {
            self.work_available.notify_one();
        }
        Ok(handle)
    }

    /// Acquire from within a content update, gated by the permission graph.
    pub(crate) fn acquire_nested(
        &self,
        updating: ResourceType,
        resource_type: ResourceType,
        id: ResourceId,
        priority: Priority,
    ) -> Result<HandleUntyped> {
        self.check_type(resource_type)?;
        let mut state = self.state.lock();
        let (effective, _) = state.resolve(
            &self.types,
            self.config.max_override_steps,
            resource_type,
            id.clone(),
        );
        if !state
            .permissions
            .is_allowed(&self.types, updating, effective)
        {
            return Err(Error::MisconfiguredPermission {
                updating: self.types.name(updating).to_owned(),
                requested: self.types.name(effective).to_owned(),
            });
        }
        drop(state);
        self.acquire(resource_type, id, Some(priority))
    }
}

/// Options and flags which can be used to configure how a [`ResourceCache`]
/// is created.
pub struct ResourceCacheOptions {
    types: TypeTable,
    devices: Vec<Arc<dyn Device>>,
    config: ResourceCacheConfig,
}

impl ResourceCacheOptions {
    /// Creates a blank set of options for [`ResourceCache`] configuration.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_config(ResourceCacheConfig::default())
    }

    /// Creates a blank set of options using `config`.
    pub fn with_config(config: ResourceCacheConfig) -> Self {
        Self {
            types: TypeTable::default(),
            devices: vec![],
            config,
        }
    }

    /// Registers a resource type. Parents must be registered first.
    ///
    /// # Errors
    /// `Error::UnknownResourceType` if the parent is not registered.
    pub fn add_resource_type(
        &mut self,
        descriptor: ResourceTypeDescriptor,
    ) -> Result<ResourceType> {
        info!("Registering resource type '{}'", descriptor.name());
        self.types.add(descriptor)
    }

    /// Adds a device that can read resources.
    #[must_use]
    pub fn add_device(mut self, device: Arc<dyn Device>) -> Self {
        self.devices.push(device);
        self
    }

    /// Creates [`ResourceCache`] based on `ResourceCacheOptions` and spawns its
    /// loading threads.
    ///
    /// # Errors
    /// If a loading thread cannot be spawned.
    pub fn create(self) -> Result<ResourceCache> {
        let worker_count = self.config.worker_count;
        let shared = Arc::new(CacheShared {
            types: self.types,
            devices: self.devices,
            config: self.config,
            state: Mutex::new(CacheState::new()),
            work_available: Condvar::new(),
            load_completed: Condvar::new(),
        });

        let cache = ResourceCache {
            shared,
            cleanup: Mutex::new(CleanupCallbacks::default()),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
        };
        for index in 0..worker_count {
            let shared = cache.shared.clone();
            let worker = std::thread::Builder::new()
                .name(format!("resource-loader-{}", index))
                .spawn(move || shared.worker_loop())?;
            cache.workers.lock().push(worker);
        }
        info!(
            "Resource cache created with {} resource types and {} loading threads",
            cache.shared.types.len(),
            worker_count
        );
        Ok(cache)
    }
}

/// Counters describing the content of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Resources in the registry.
    pub resources: usize,
    /// Resources in the `Loaded` state.
    pub loaded: usize,
    /// Resources in the `LoadedResourceMissing` state.
    pub missing: usize,
    /// Loads waiting in the queue.
    pub queued: usize,
    /// Resources owned by a running load, low-resolution update or unload.
    pub in_flight: usize,
    /// Sum of the estimates reported by the loaders.
    pub memory_usage: MemoryUsage,
}

/// Typed resource cache and loading manager.
///
/// Resources are requested by (type, id) and returned as reference-counted
/// handles; loading happens in the background on a pool of loading threads.
/// The cache is torn down with [`ResourceCache::shutdown`], or when dropped.
pub struct ResourceCache {
    pub(crate) shared: Arc<CacheShared>,
    cleanup: Mutex<CleanupCallbacks>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceCache {
    /// Returns a handle to the resource serving (type, id), scheduling its load
    /// with `priority` if it is not loaded.
    ///
    /// # Errors
    /// `Error::CreationFailed` if the resource could not be allocated,
    /// `Error::ShuttingDown` once shutdown started cancelling loads.
    pub fn acquire(
        &self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
        priority: Priority,
    ) -> Result<HandleUntyped> {
        self.shared.acquire(resource_type, id.into(), Some(priority))
    }

    /// Same as [`Self::acquire`], with the default priority of the effective type.
    pub fn acquire_default(
        &self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
    ) -> Result<HandleUntyped> {
        self.shared.acquire(resource_type, id.into(), None)
    }

    /// Same as [`Self::acquire`], returning a handle typed over `T`.
    pub fn acquire_typed<T: Resource>(
        &self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
        priority: Priority,
    ) -> Result<Handle<T>> {
        self.acquire(resource_type, id, priority).map(HandleUntyped::typed)
    }

    /// Returns a handle to the resource if it exists, without creating or
    /// loading it.
    pub fn lookup(
        &self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
    ) -> Option<HandleUntyped> {
        if !self.shared.types.contains(resource_type) {
            return None;
        }
        self.shared.state.lock().get_existing(
            &self.shared.types,
            self.shared.config.max_override_steps,
            resource_type,
            id.into(),
        )
    }

    /// Releases a handle.
    pub fn release(&self, handle: impl Into<HandleUntyped>) {
        drop(handle.into());
    }

    /// Loads the resource on the calling thread if it is not loaded, or waits
    /// for the thread currently loading it.
    pub fn force_load_now(&self, handle: &HandleUntyped) -> LoadingState {
        self.shared.force_load_now(handle);
        handle.loading_state()
    }

    /// Schedules a reload of a loaded resource. Returns false if the resource
    /// is not `Loaded` (including `LoadedResourceMissing`), not reloadable or
    /// already queued.
    pub fn reload(&self, handle: &HandleUntyped) -> bool {
        let mut state = self.shared.state.lock();
        let priority = match state.registry.get(handle.key()) {
            Some(record) => record.priority,
            None => return false,
        };
        let queued = state.enqueue(handle.key(), priority, true);
        if queued {
            self.shared.work_available.notify_one();
        }
        queued
    }

    /// Resets the resource to freshly allocated `Unloaded` content. Returns
    /// false if it is queued or being loaded.
    ///
    /// # Errors
    /// `Error::CreationFailed` if the fresh content could not be allocated.
    pub fn unload(&self, handle: &HandleUntyped) -> Result<bool> {
        self.shared.unload(handle)
    }

    /// Feeds low-resolution data through the loader's content update ahead of
    /// the full load. Returns false if the data was not applied.
    ///
    /// # Errors
    /// The loader's error if the update failed.
    pub fn set_low_resolution_data(&self, handle: &HandleUntyped, data: Vec<u8>) -> Result<bool> {
        self.shared.set_low_resolution_data(handle, data)
    }

    /// Removes an unreferenced, idle resource now. Returns false if no
    /// resource serves (type, id).
    ///
    /// # Errors
    /// `Error::StillReferenced` or `Error::Busy`.
    pub fn deallocate(
        &self,
        resource_type: ResourceType,
        id: impl Into<ResourceId>,
    ) -> Result<bool> {
        self.shared.check_type(resource_type)?;
        let mut state = self.shared.state.lock();
        let (effective, id) = state.resolve(
            &self.shared.types,
            self.shared.config.max_override_steps,
            resource_type,
            id.into(),
        );
        match state.registry.lookup(effective, &id) {
            Some(key) => state.try_evict(key).map(|()| true),
            None => Ok(false),
        }
    }

    /// Makes requests of `base` whose id satisfies `predicate` resolve to
    /// `derived`.
    ///
    /// # Errors
    /// `Error::InvalidOverride` if `derived` does not derive from `base`,
    /// `Error::DuplicateOverride` if `derived` already overrides an ancestor.
    pub fn register_type_override(
        &self,
        base: ResourceType,
        derived: ResourceType,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.check_type(base)?;
        self.shared.check_type(derived)?;
        self.shared.state.lock().resolution.register_override(
            &self.shared.types,
            base,
            derived,
            Arc::new(predicate),
        )
    }

    /// Returns true if `derived` had overrides registered.
    pub fn unregister_type_override(&self, derived: ResourceType) -> bool {
        self.shared.types.contains(derived)
            && self
                .shared
                .state
                .lock()
                .resolution
                .unregister_override(&self.shared.types, derived)
    }

    /// Makes every following request of `alias` resolve to `canonical`.
    pub fn register_named_redirect(
        &self,
        alias: impl Into<ResourceId>,
        canonical: impl Into<ResourceId>,
    ) {
        self.shared
            .state
            .lock()
            .resolution
            .register_redirect(&alias.into(), canonical.into());
    }

    /// Returns true if `alias` was redirected.
    pub fn unregister_named_redirect(&self, alias: impl Into<ResourceId>) -> bool {
        self.shared
            .state
            .lock()
            .resolution
            .unregister_redirect(&alias.into())
    }

    /// Declares that content updates of `updating` may acquire resources of
    /// `may_acquire` or of any type derived from it.
    ///
    /// Must happen before a content update of either type acquires anything.
    ///
    /// # Errors
    /// `Error::UnknownResourceType` if either type is not registered.
    pub fn allow_nested_acquire(
        &self,
        updating: ResourceType,
        may_acquire: ResourceType,
    ) -> Result<()> {
        self.shared.check_type(updating)?;
        self.shared.check_type(may_acquire)?;
        self.shared
            .state
            .lock()
            .permissions
            .allow(updating, may_acquire);
        Ok(())
    }

    /// Removes every unreferenced resource. Returns how many were removed.
    pub fn evict_all_unused(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.evict_all_unused(&mut state)
    }

    /// Incremental sweep: evicts unreferenced resources of the
    /// incremental-unload eligible types that have been idle for more than
    /// `min_idle`, spending at most `time_budget`.
    pub fn evict_unused(&self, time_budget: Duration, min_idle: Duration) -> usize {
        self.shared.evict_unused(time_budget, min_idle)
    }

    /// Subscribes to the events of every resource. `Exists` is sent right
    /// away for each loaded resource.
    ///
    /// Callbacks run with the cache lock held: they must not call into the
    /// cache nor read resource content, which a loading thread may hold while
    /// waiting for that lock. Use [`Self::subscribe_channel`] to react to
    /// events with full access to the cache.
    pub fn subscribe(
        &self,
        mut callback: impl FnMut(&ResourceEvent) + Send + 'static,
    ) -> SubscriptionId {
        let mut state = self.shared.state.lock();
        for info in state.loaded_resources() {
            callback(&ResourceEvent::Exists(info));
        }
        state.events.subscribe(Box::new(callback))
    }

    /// Same as [`Self::subscribe`], delivering the events through a channel.
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<ResourceEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut state = self.shared.state.lock();
        for info in state.loaded_resources() {
            let _ = sender.send(ResourceEvent::Exists(info));
        }
        (state.events.subscribe_channel(sender), receiver)
    }

    /// Subscribes to the events of a single resource. Subscribers of a
    /// resource are notified before global subscribers.
    ///
    /// Same restrictions on the callback as [`Self::subscribe`].
    pub fn subscribe_resource(
        &self,
        handle: &HandleUntyped,
        mut callback: impl FnMut(&ResourceEvent) + Send + 'static,
    ) -> SubscriptionId {
        let mut state = self.shared.state.lock();
        if handle.loading_state() == LoadingState::Loaded {
            callback(&ResourceEvent::Exists(ResourceInfo::from_slot(handle.slot())));
        }
        state
            .events
            .subscribe_resource(handle.key(), Box::new(callback))
    }

    /// Returns true if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.state.lock().events.unsubscribe(id)
    }

    /// Registers a callback run once during shutdown, before loads are
    /// cancelled.
    pub fn add_cleanup_callback(&self, callback: impl FnOnce(&Self) + Send + 'static) {
        let mut cleanup = self.cleanup.lock();
        debug_assert!(!cleanup.closed, "cleanup callback added after shutdown");
        if cleanup.closed {
            warn!("Ignoring cleanup callback added after shutdown");
            return;
        }
        cleanup.pending.push(Box::new(callback));
    }

    /// Runs up to `max_jobs` queued loads on the calling thread. Returns how
    /// many ran.
    pub fn pump(&self, max_jobs: usize) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.pump(&mut state, max_jobs)
    }

    /// Blocks until the resource is neither queued nor being loaded, or until
    /// `timeout` expires. Helps with the queued loads when the cache has no
    /// loading threads.
    pub fn wait_for_load(&self, handle: &HandleUntyped, timeout: Duration) -> LoadingState {
        let deadline = Instant::now() + timeout;
        let key = handle.key();
        let mut state = self.shared.state.lock();
        loop {
            let pending = state.in_flight.contains_key(&key)
                || state.registry.get(key).map_or(false, |record| record.is_queued());
            if !pending {
                break;
            }
            if self.shared.config.worker_count == 0 && self.shared.pump(&mut state, 1) > 0 {
                continue;
            }
            if self
                .shared
                .load_completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        handle.loading_state()
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        let mut stats = CacheStats {
            resources: state.registry.len(),
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            ..CacheStats::default()
        };
        for (_, record) in state.registry.records() {
            match record.slot.state() {
                LoadingState::Loaded => stats.loaded += 1,
                LoadingState::LoadedResourceMissing => stats.missing += 1,
                LoadingState::Unloaded | LoadingState::Loading => {}
            }
            stats.memory_usage += record.memory_usage;
        }
        stats
    }

    /// Status flags of the resource, empty if it was deallocated.
    pub fn flags(&self, handle: &HandleUntyped) -> ResourceFlags {
        self.shared
            .state
            .lock()
            .registry
            .get(handle.key())
            .map_or(ResourceFlags::empty(), |record| record.flags)
    }

    /// Memory usage reported by the loader for the resource.
    pub fn memory_usage(&self, handle: &HandleUntyped) -> MemoryUsage {
        self.shared
            .state
            .lock()
            .registry
            .get(handle.key())
            .map_or_else(MemoryUsage::default, |record| record.memory_usage)
    }

    /// Type registered under `name`.
    pub fn find_resource_type(&self, name: &str) -> Option<ResourceType> {
        self.shared
            .types
            .iter()
            .find(|ty| self.shared.types.name(*ty) == name)
    }

    /// Name of a registered type.
    pub fn resource_type_name(&self, resource_type: ResourceType) -> Option<&str> {
        self.shared
            .types
            .contains(resource_type)
            .then(|| self.shared.types.name(resource_type))
    }

    /// Configuration the cache was created with.
    pub fn config(&self) -> &ResourceCacheConfig {
        &self.shared.config
    }

    /// Tears the cache down:
    /// - notifies subscribers with `ShuttingDown`,
    /// - runs the cleanup callbacks, including those they add,
    /// - stops accepting loads, cancels the queued and running ones and joins
    ///   the loading threads,
    /// - evicts every unreferenced resource.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    /// `Error::ShutdownLeak` listing the resources still referenced at the end.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
            state.events.broadcast(None, &ResourceEvent::ShuttingDown);
        }
        info!("Shutting down resource cache");

        loop {
            let callbacks = {
                let mut cleanup = self.cleanup.lock();
                if cleanup.pending.is_empty() {
                    cleanup.closed = true;
                    break;
                }
                std::mem::take(&mut cleanup.pending)
            };
            for callback in callbacks {
                callback(self);
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.accepting_loads = false;
            let cancelled = state.cancel_all();
            if cancelled > 0 {
                info!("Cancelled {} pending loads", cancelled);
            }
            state.terminate_workers = true;
        }
        self.shared.work_available.notify_all();
        self.shared.load_completed.notify_all();
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                error!("A resource loading thread panicked");
            }
        }

        let mut state = self.shared.state.lock();
        self.shared.evict_all_unused(&mut state);
        let leaked: Vec<LeakedResource> = state
            .registry
            .records()
            .map(|(_, record)| LeakedResource {
                type_name: record.slot.type_name.to_string(),
                ref_count: record.slot.ref_count(),
                id: record.slot.id.clone(),
            })
            .collect();
        if leaked.is_empty() {
            return Ok(());
        }
        for leak in &leaked {
            error!("Resource still referenced at shutdown: {}", leak);
        }
        Err(Error::ShutdownLeak(leaked))
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("{}", err);
        }
    }
}
