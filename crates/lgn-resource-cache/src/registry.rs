use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::Arc,
    time::Instant,
};

use log::debug;
use slotmap::SlotMap;

use crate::{
    handle::ResourceSlot, resource_type::TypeTable, Error, HandleUntyped, MemoryUsage, Priority,
    ResourceFlags, ResourceId, ResourceType, Result,
};

slotmap::new_key_type! {
    /// Key of a resource within the [`Registry`].
    pub struct ResourceKey;
}

/// Position of a resource in registry order.
pub(crate) type RegistryPosition = (ResourceType, u64);

/// Bookkeeping of a resource, only accessed with the cache lock held.
pub(crate) struct ResourceRecord {
    pub(crate) slot: Arc<ResourceSlot>,
    pub(crate) flags: ResourceFlags,
    pub(crate) priority: Priority,
    pub(crate) last_acquire: Instant,
    pub(crate) memory_usage: MemoryUsage,
}

impl ResourceRecord {
    pub(crate) fn is_queued(&self) -> bool {
        self.flags.contains(ResourceFlags::QUEUED_FOR_LOADING)
    }
}

/// Resource storage keyed by effective type and id hash.
///
/// Every live resource is reachable from exactly one slot. Ordering of the
/// index groups resources by type, which the incremental sweep relies on.
#[derive(Default)]
pub(crate) struct Registry {
    entries: SlotMap<ResourceKey, ResourceRecord>,
    index: BTreeMap<RegistryPosition, ResourceKey>,
}

impl Registry {
    pub(crate) fn lookup(
        &self,
        resource_type: ResourceType,
        id: &ResourceId,
    ) -> Option<ResourceKey> {
        self.index.get(&(resource_type, id.hash_value())).copied()
    }

    /// Allocates and registers a new resource in the `Unloaded` state.
    pub(crate) fn insert(
        &mut self,
        types: &TypeTable,
        resource_type: ResourceType,
        id: ResourceId,
    ) -> Result<ResourceKey> {
        debug_assert!(self.lookup(resource_type, &id).is_none());

        let descriptor = types.descriptor(resource_type);
        let content = descriptor
            .allocate()
            .map_err(|reason| Error::CreationFailed {
                type_name: descriptor.name().to_owned(),
                id: id.clone(),
                reason,
            })?;

        let mut flags = ResourceFlags::empty();
        if descriptor.is_reloadable() {
            flags |= ResourceFlags::RELOADABLE;
        }
        let type_name: Arc<str> = Arc::from(descriptor.name());
        let position = (resource_type, id.hash_value());

        let key = self.entries.insert_with_key(|key| ResourceRecord {
            slot: Arc::new(ResourceSlot::new(
                key,
                resource_type,
                type_name,
                id,
                content,
            )),
            flags,
            priority: descriptor.default_priority(),
            last_acquire: Instant::now(),
            memory_usage: MemoryUsage::default(),
        });
        self.index.insert(position, key);
        debug!("Registering {} '{}' ({:?})", descriptor.name(), self.entries[key].slot.id, key);
        Ok(key)
    }

    /// New handle to an existing resource; refreshes its last acquire time.
    pub(crate) fn acquire(&mut self, key: ResourceKey, now: Instant) -> Option<HandleUntyped> {
        self.entries.get_mut(key).map(|record| {
            record.last_acquire = now;
            HandleUntyped::new(record.slot.clone())
        })
    }

    pub(crate) fn get(&self, key: ResourceKey) -> Option<&ResourceRecord> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: ResourceKey) -> Option<&mut ResourceRecord> {
        self.entries.get_mut(key)
    }

    /// Checks whether a resource could be deallocated right now.
    pub(crate) fn check_deallocate(&self, key: ResourceKey) -> Result<()> {
        if let Some(record) = self.entries.get(key) {
            let ref_count = record.slot.ref_count();
            if ref_count > 0 {
                return Err(Error::StillReferenced {
                    id: record.slot.id.clone(),
                    ref_count,
                });
            }
            if record.is_queued() {
                return Err(Error::Busy(record.slot.id.clone()));
            }
        }
        Ok(())
    }

    /// Removes a zero-reference, not queued resource.
    ///
    /// The content is freed once the last alias of the slot goes away, which
    /// is immediately unless a cancelled load job still holds it.
    pub(crate) fn deallocate(&mut self, key: ResourceKey) -> Result<Option<ResourceRecord>> {
        self.check_deallocate(key)?;
        Ok(self.entries.remove(key).map(|record| {
            self.index
                .remove(&(record.slot.resource_type, record.slot.id.hash_value()));
            debug!(
                "Dropping {} '{}' ({:?})",
                record.slot.type_name, record.slot.id, key
            );
            record
        }))
    }

    /// First entry strictly after `after`, skipping every type for which
    /// `eligible` is false.
    pub(crate) fn next_entry(
        &self,
        after: Option<RegistryPosition>,
        eligible: impl Fn(ResourceType) -> bool,
    ) -> Option<(RegistryPosition, ResourceKey)> {
        let mut lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        loop {
            let (&position, &key) = self.index.range((lower, Bound::Unbounded)).next()?;
            if eligible(position.0) {
                return Some((position, key));
            }
            let next_type = ResourceType::from_index(position.0.index() + 1);
            lower = Bound::Included((next_type, 0));
        }
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = (ResourceKey, &ResourceRecord)> + '_ {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
