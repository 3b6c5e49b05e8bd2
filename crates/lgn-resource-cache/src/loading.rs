//! Loading pipeline: queued loads run the data load stage without the cache
//! lock, then the content update stage under the resource's content lock, and
//! finally publish their outcome under the cache lock.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use log::{debug, info, warn};
use parking_lot::MutexGuard;

use crate::{
    events::{ResourceEvent, ResourceInfo},
    handle::ResourceSlot,
    loading_queue::QueuedLoad,
    registry::ResourceKey,
    resource_cache::{CacheShared, CacheState},
    resource_loader::{DataQuality, LoadRequest, UpdateContext},
    Error, HandleUntyped, LoadingState, MemoryUsage, Priority, ResourceFlags, Result,
};

/// Cooperative cancellation flag shared with a running job.
///
/// Also identifies the job: a finished job only publishes if its token is still
/// the one registered for its resource.
#[derive(Clone, Default)]
pub(crate) struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

pub(crate) struct LoadJob {
    slot: Arc<ResourceSlot>,
    reload: bool,
    previous: LoadingState,
    token: CancellationToken,
    on_caller_thread: bool,
}

pub(crate) enum LoadOutcome {
    Loaded(MemoryUsage),
    Failed { fallback: bool },
    Cancelled,
}

impl CacheState {
    /// Queues a load. No-op if the resource is already queued, or if it is
    /// not `Unloaded` and this is not a reload. A reload requires a reloadable
    /// resource that is `Loaded`.
    ///
    /// A resource claimed by a low-resolution update or an unload can still be
    /// queued; its load starts once the claim is released.
    pub(crate) fn enqueue(&mut self, key: ResourceKey, priority: Priority, reload: bool) -> bool {
        if !self.accepting_loads || self.queue.contains(key) {
            return false;
        }

        let record = match self.registry.get_mut(key) {
            Some(record) => record,
            None => return false,
        };
        let state = record.slot.state();
        if reload {
            if !record.flags.contains(ResourceFlags::RELOADABLE) || state != LoadingState::Loaded {
                return false;
            }
        } else if state != LoadingState::Unloaded {
            return false;
        }

        record.flags |= ResourceFlags::QUEUED_FOR_LOADING;
        record.priority = priority;
        self.queue.push(key, priority, reload)
    }

    /// Registers a single owner for the resource's content.
    pub(crate) fn claim(&mut self, key: ResourceKey) -> Option<CancellationToken> {
        if self.in_flight.contains_key(&key) {
            return None;
        }
        let token = CancellationToken::default();
        self.in_flight.insert(key, token.clone());
        Some(token)
    }

    /// Returns false if the claim was cancelled in the meantime.
    pub(crate) fn release_claim(&mut self, key: ResourceKey, token: &CancellationToken) -> bool {
        match self.in_flight.get(&key) {
            Some(current) if current.same_as(token) => {
                self.in_flight.remove(&key);
                true
            }
            _ => false,
        }
    }

    fn begin_job(&mut self, load: QueuedLoad, on_caller_thread: bool) -> Option<LoadJob> {
        let slot = self.registry.get(load.key)?.slot.clone();
        let token = self.claim(load.key)?;
        let previous = slot.state();
        slot.set_state(LoadingState::Loading);
        Some(LoadJob {
            slot,
            reload: load.reload,
            previous,
            token,
            on_caller_thread,
        })
    }

    fn next_job(&mut self) -> Option<LoadJob> {
        let in_flight = &self.in_flight;
        let load = self
            .queue
            .pop_eligible(|key| !in_flight.contains_key(&key))?;
        self.begin_job(load, false)
    }

    /// Drops queued loads and cancels the running ones. Every affected
    /// resource leaves with its queued flag cleared.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let mut keys: Vec<ResourceKey> = self
            .queue
            .drain()
            .into_iter()
            .map(|load| load.key)
            .collect();
        for (key, token) in self.in_flight.drain() {
            token.cancel();
            keys.push(key);
        }
        for key in &keys {
            if let Some(record) = self.registry.get_mut(*key) {
                record.flags -= ResourceFlags::QUEUED_FOR_LOADING;
            }
        }
        keys.len()
    }

    fn publish(&mut self, job: &LoadJob, outcome: LoadOutcome) {
        let key = job.slot.key;
        if !self.release_claim(key, &job.token) {
            debug!(
                "Discarding cancelled load of {} '{}'",
                job.slot.type_name, job.slot.id
            );
            return;
        }
        let record = match self.registry.get_mut(key) {
            Some(record) => record,
            None => return,
        };
        record.flags -= ResourceFlags::QUEUED_FOR_LOADING;

        let event = match outcome {
            LoadOutcome::Loaded(usage) => {
                record.memory_usage = usage;
                record.flags -= ResourceFlags::HAS_TYPE_FALLBACK;
                if job.on_caller_thread {
                    record.flags |= ResourceFlags::CREATED_VIA_CUSTOM_LOADER;
                }
                let info = ResourceInfo::from_slot(&record.slot);
                if job.reload && job.previous.is_finished() {
                    ResourceEvent::Reloaded(info)
                } else {
                    ResourceEvent::Loaded(info)
                }
            }
            LoadOutcome::Failed { fallback } => {
                record.memory_usage = MemoryUsage::default();
                record.flags.set(ResourceFlags::HAS_TYPE_FALLBACK, fallback);
                ResourceEvent::LoadFailed(ResourceInfo::from_slot(&record.slot))
            }
            LoadOutcome::Cancelled => return,
        };
        self.events.broadcast(Some(key), &event);
    }
}

impl CacheShared {
    pub(crate) fn worker_loop(self: Arc<Self>) {
        let mut state = self.state.lock();
        while !state.terminate_workers {
            if let Some(job) = state.next_job() {
                self.execute(&mut state, &job);
            } else {
                self.work_available.wait(&mut state);
            }
        }
    }

    /// Runs up to `max_jobs` queued loads on the calling thread.
    pub(crate) fn pump(&self, state: &mut MutexGuard<'_, CacheState>, max_jobs: usize) -> usize {
        let mut count = 0;
        while count < max_jobs {
            let job = match state.next_job() {
                Some(job) => job,
                None => break,
            };
            self.execute(state, &job);
            count += 1;
        }
        count
    }

    fn execute(&self, state: &mut MutexGuard<'_, CacheState>, job: &LoadJob) {
        let outcome = MutexGuard::unlocked(state, || self.run_job(job));
        state.publish(job, outcome);
        self.load_completed.notify_all();
    }

    fn run_job(&self, job: &LoadJob) -> LoadOutcome {
        let start = Instant::now();
        let slot = &job.slot;
        let loader = match self.types.loader(slot.resource_type) {
            Some(loader) => loader,
            None => {
                warn!("No loader registered for {} '{}'", slot.type_name, slot.id);
                slot.set_state(LoadingState::LoadedResourceMissing);
                return LoadOutcome::Failed { fallback: false };
            }
        };

        let request = LoadRequest {
            id: &slot.id,
            resource_type: slot.resource_type,
            type_name: &slot.type_name,
            reload: job.reload,
            devices: &self.devices,
            token: &job.token,
        };
        let data = loader.load_data(&request);
        if job.token.is_cancelled() {
            debug!("Cancelled load of {} '{}'", slot.type_name, slot.id);
            slot.set_state(job.previous);
            return LoadOutcome::Cancelled;
        }

        let result = data.and_then(|mut data| {
            let mut content = slot.content.write();
            let mut context = UpdateContext::new(self, slot.resource_type, DataQuality::Full);
            loader.update_content(&mut **content, &mut data, &mut context)?;
            let usage = loader.estimate_memory_usage(&**content);
            debug_assert!(
                usage.is_some(),
                "loader of {} did not report the memory usage of '{}'",
                slot.type_name,
                slot.id
            );
            // published while the content lock is held, low-resolution updates re-check it
            slot.set_state(LoadingState::Loaded);
            Ok(usage.unwrap_or_default())
        });

        match result {
            Ok(usage) => {
                info!(
                    "Loaded {} '{}' in {:?}",
                    slot.type_name,
                    slot.id,
                    start.elapsed()
                );
                LoadOutcome::Loaded(usage)
            }
            Err(err) => {
                warn!("Failed to load {} '{}': {}", slot.type_name, slot.id, err);
                let mut content = slot.content.write();
                let fallback = loader.apply_fallback(&mut **content);
                slot.set_state(LoadingState::LoadedResourceMissing);
                LoadOutcome::Failed { fallback }
            }
        }
    }

    /// Loads the resource on the calling thread, or waits for the thread
    /// already loading it.
    pub(crate) fn force_load_now(&self, handle: &HandleUntyped) {
        let key = handle.key();
        let mut state = self.state.lock();
        let job = loop {
            if state.in_flight.contains_key(&key) {
                self.load_completed.wait(&mut state);
                continue;
            }
            if let Some(load) = state.queue.remove(key) {
                break state.begin_job(load, true);
            }
            if handle.loading_state() != LoadingState::Unloaded || !state.accepting_loads {
                return;
            }
            if let Some(record) = state.registry.get_mut(key) {
                record.flags |= ResourceFlags::QUEUED_FOR_LOADING;
            }
            let load = QueuedLoad {
                key,
                priority: Priority::Critical,
                reload: false,
            };
            break state.begin_job(load, true);
        };
        if let Some(job) = job {
            self.execute(&mut state, &job);
        }
    }

    /// Applies cheap partial data ahead of the full load.
    ///
    /// Returns false without touching the resource if it is being loaded, has
    /// already received low-resolution data, is not reloadable, or is loaded.
    pub(crate) fn set_low_resolution_data(
        &self,
        handle: &HandleUntyped,
        mut data: Vec<u8>,
    ) -> Result<bool> {
        let key = handle.key();
        let slot = handle.slot().clone();
        let loader = match self.types.loader(slot.resource_type) {
            Some(loader) => loader,
            None => return Ok(false),
        };

        let token = {
            let mut state = self.state.lock();
            if !state.accepting_loads {
                return Ok(false);
            }
            let record = match state.registry.get(key) {
                Some(record) => record,
                None => return Ok(false),
            };
            if !record.flags.contains(ResourceFlags::RELOADABLE)
                || record.flags.contains(ResourceFlags::HAS_LOW_RESOLUTION_DATA)
                || slot.state().is_finished()
            {
                return Ok(false);
            }
            let token = match state.claim(key) {
                Some(token) => token,
                None => return Ok(false),
            };
            if let Some(record) = state.registry.get_mut(key) {
                record.flags |= ResourceFlags::HAS_LOW_RESOLUTION_DATA;
            }
            token
        };

        let result = {
            let mut content = slot.content.write();
            if slot.state().is_finished() {
                Ok(None)
            } else {
                let mut context =
                    UpdateContext::new(self, slot.resource_type, DataQuality::LowResolution);
                loader
                    .update_content(&mut **content, &mut data, &mut context)
                    .map(|()| {
                        let usage = loader.estimate_memory_usage(&**content);
                        debug_assert!(
                            usage.is_some(),
                            "loader of {} did not report the memory usage of '{}'",
                            slot.type_name,
                            slot.id
                        );
                        Some(usage.unwrap_or_default())
                    })
            }
        };

        let mut state = self.state.lock();
        let owned = state.release_claim(key, &token);
        let applied = match &result {
            Ok(Some(usage)) => {
                if let Some(record) = state.registry.get_mut(key) {
                    if owned && !slot.state().is_finished() {
                        record.memory_usage = *usage;
                    }
                }
                true
            }
            Ok(None) | Err(_) => {
                if let Some(record) = state.registry.get_mut(key) {
                    record.flags -= ResourceFlags::HAS_LOW_RESOLUTION_DATA;
                }
                false
            }
        };
        drop(state);
        self.work_available.notify_all();
        self.load_completed.notify_all();

        result.map(|_| applied).map_err(|err| {
            warn!(
                "Failed to apply low resolution data to {} '{}': {}",
                slot.type_name, slot.id, err
            );
            err
        })
    }

    /// Resets a resource to freshly allocated content.
    pub(crate) fn unload(&self, handle: &HandleUntyped) -> Result<bool> {
        let key = handle.key();
        let slot = handle.slot().clone();
        let token = {
            let mut state = self.state.lock();
            match state.registry.get(key) {
                Some(record) if !record.is_queued() => {}
                _ => return Ok(false),
            }
            match state.claim(key) {
                Some(token) => token,
                None => return Ok(false),
            }
        };

        let descriptor = self.types.descriptor(slot.resource_type);
        let fresh = descriptor.allocate().map_err(|reason| Error::CreationFailed {
            type_name: descriptor.name().to_owned(),
            id: slot.id.clone(),
            reason,
        });
        let unloaded = fresh.map(|fresh| {
            *slot.content.write() = fresh;
            slot.set_state(LoadingState::Unloaded);
            true
        });

        let mut state = self.state.lock();
        if state.release_claim(key, &token) {
            if let (Ok(true), Some(record)) = (&unloaded, state.registry.get_mut(key)) {
                record.memory_usage = MemoryUsage::default();
                record.flags -= ResourceFlags::HAS_LOW_RESOLUTION_DATA
                    | ResourceFlags::HAS_TYPE_FALLBACK
                    | ResourceFlags::CREATED_VIA_CUSTOM_LOADER;
                debug!("Unloaded {} '{}'", slot.type_name, slot.id);
            }
        }
        drop(state);
        self.work_available.notify_all();
        self.load_completed.notify_all();
        unloaded
    }
}
