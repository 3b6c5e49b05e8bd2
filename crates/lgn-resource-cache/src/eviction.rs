use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::MutexGuard;

use crate::{
    events::{ResourceEvent, ResourceInfo},
    registry::ResourceKey,
    resource_cache::{CacheShared, CacheState},
    Error, ResourceType, Result,
};

impl CacheState {
    /// Deallocates an unreferenced resource that is neither queued nor
    /// in flight, firing `Deleted` right before it is freed.
    pub(crate) fn try_evict(&mut self, key: ResourceKey) -> Result<()> {
        if self.in_flight.contains_key(&key) {
            if let Some(record) = self.registry.get(key) {
                return Err(Error::Busy(record.slot.id.clone()));
            }
        }
        self.registry.check_deallocate(key)?;
        if let Some(record) = self.registry.get(key) {
            let event = ResourceEvent::Deleted(ResourceInfo::from_slot(&record.slot));
            self.events.broadcast(Some(key), &event);
        }
        self.registry.deallocate(key)?;
        self.events.forget_resource(key);
        Ok(())
    }

    /// One pass over every unreferenced resource. Returns how many were
    /// removed and how many were busy.
    fn sweep_unused(&mut self) -> (usize, usize) {
        let candidates: Vec<ResourceKey> = self
            .registry
            .records()
            .filter(|(_, record)| record.slot.ref_count() == 0)
            .map(|(key, _)| key)
            .collect();

        let mut removed = 0;
        let mut busy = 0;
        for key in candidates {
            match self.try_evict(key) {
                Ok(()) => removed += 1,
                Err(Error::Busy(_)) => busy += 1,
                Err(_) => {}
            }
        }
        (removed, busy)
    }
}

impl CacheShared {
    /// Removes every unreferenced resource, waiting for the loads of the busy
    /// ones to complete.
    pub(crate) fn evict_all_unused(&self, state: &mut MutexGuard<'_, CacheState>) -> usize {
        let mut evicted = 0;
        loop {
            let (removed, busy) = state.sweep_unused();
            evicted += removed;
            if busy == 0 {
                if removed == 0 {
                    break;
                }
                continue;
            }
            if removed == 0 {
                self.help_progress(state);
            }
        }
        if evicted > 0 {
            debug!("Evicted {} unused resources", evicted);
        }
        evicted
    }

    /// Runs a bounded batch of queued loads on this thread, or waits a little
    /// for the threads running them.
    fn help_progress(&self, state: &mut MutexGuard<'_, CacheState>) {
        if self.pump(state, self.config.progress_batch) == 0 {
            trace!("Waiting on in-flight loads to evict their resources");
            let _ = self
                .load_completed
                .wait_for(state, self.config.progress_wait());
        }
    }

    /// Resumes the incremental sweep where the previous call stopped.
    ///
    /// Only types allowing incremental unload are visited. A resource is evicted
    /// if it is unreferenced and was last acquired more than `min_idle` ago.
    /// Visits each resource at most once per call.
    pub(crate) fn evict_unused(&self, time_budget: Duration, min_idle: Duration) -> usize {
        let start = Instant::now();
        self.sweep_idle(min_idle, || start.elapsed() < time_budget)
    }

    /// Visits entries from the cursor on while `keep_going` holds.
    fn sweep_idle(&self, min_idle: Duration, mut keep_going: impl FnMut() -> bool) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let types = &self.types;
        let eligible = |ty: ResourceType| types.descriptor(ty).is_incremental_unload_eligible();

        let mut first_visited = None;
        let mut evicted = 0;
        let mut wrapped = false;
        while keep_going() {
            match state.registry.next_entry(state.cursor, &eligible) {
                None => {
                    state.cursor = None;
                    if wrapped {
                        break;
                    }
                    wrapped = true;
                }
                Some((position, key)) => {
                    if wrapped && first_visited.map_or(false, |first| position >= first) {
                        break;
                    }
                    first_visited.get_or_insert(position);
                    state.cursor = Some(position);
                    let idle = state.registry.get(key).map_or(false, |record| {
                        record.slot.ref_count() == 0
                            && Instant::now().saturating_duration_since(record.last_acquire)
                                > min_idle
                    });
                    if idle && state.try_evict(key).is_ok() {
                        evicted += 1;
                    }
                }
            }
        }
        evicted
    }
}
