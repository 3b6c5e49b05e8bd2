use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
};

use crate::{registry::ResourceKey, Priority};

type QueueOrder = (Reverse<Priority>, u64);

/// A load waiting for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedLoad {
    pub(crate) key: ResourceKey,
    pub(crate) priority: Priority,
    pub(crate) reload: bool,
}

/// Pending loads ordered by priority, FIFO within a priority band.
#[derive(Default)]
pub(crate) struct LoadingQueue {
    next_sequence: u64,
    order: BTreeMap<QueueOrder, QueuedLoad>,
    positions: HashMap<ResourceKey, QueueOrder>,
}

impl LoadingQueue {
    /// Returns false if the resource is already queued.
    pub(crate) fn push(&mut self, key: ResourceKey, priority: Priority, reload: bool) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        let order = (Reverse(priority), self.next_sequence);
        self.next_sequence += 1;
        self.order.insert(
            order,
            QueuedLoad {
                key,
                priority,
                reload,
            },
        );
        self.positions.insert(key, order);
        true
    }

    #[cfg(test)]
    pub(crate) fn pop(&mut self) -> Option<QueuedLoad> {
        let (_, load) = self.order.pop_first()?;
        self.positions.remove(&load.key);
        Some(load)
    }

    /// Pops the first load for which `eligible` holds, leaving the others in place.
    pub(crate) fn pop_eligible(
        &mut self,
        eligible: impl Fn(ResourceKey) -> bool,
    ) -> Option<QueuedLoad> {
        let order = *self
            .order
            .iter()
            .find(|(_, load)| eligible(load.key))
            .map(|(order, _)| order)?;
        let load = self.order.remove(&order)?;
        self.positions.remove(&load.key);
        Some(load)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: ResourceKey) -> Option<&QueuedLoad> {
        self.positions
            .get(&key)
            .and_then(|order| self.order.get(order))
    }

    pub(crate) fn remove(&mut self, key: ResourceKey) -> Option<QueuedLoad> {
        let order = self.positions.remove(&key)?;
        self.order.remove(&order)
    }

    pub(crate) fn contains(&self, key: ResourceKey) -> bool {
        self.positions.contains_key(&key)
    }

    pub(crate) fn drain(&mut self) -> Vec<QueuedLoad> {
        self.positions.clear();
        std::mem::take(&mut self.order).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
