//! Resource lifecycle notifications.
//!
//! Events are broadcast while the cache lock is held: subscribers must not call
//! back into the [`crate::ResourceCache`] from a callback. Channel subscribers
//! can forward events to code that does.

use std::{collections::HashMap, fmt, sync::Arc};

use crossbeam_channel::Sender;

use crate::{handle::ResourceSlot, registry::ResourceKey, LoadingState, ResourceId, ResourceType};

/// Identity of the resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Effective type of the resource.
    pub resource_type: ResourceType,
    /// Name of the effective type.
    pub type_name: Arc<str>,
    /// Id of the resource.
    pub id: ResourceId,
    /// Loading state when the event was sent.
    pub state: LoadingState,
}

impl ResourceInfo {
    pub(crate) fn from_slot(slot: &ResourceSlot) -> Self {
        Self {
            resource_type: slot.resource_type,
            type_name: slot.type_name.clone(),
            id: slot.id.clone(),
            state: slot.state(),
        }
    }
}

/// Resource lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// The resource is loaded. Sent to new subscribers for every loaded resource.
    Exists(ResourceInfo),
    /// A load completed.
    Loaded(ResourceInfo),
    /// A load did not produce data; the resource holds its fallback content.
    LoadFailed(ResourceInfo),
    /// A reload of an already loaded resource completed.
    Reloaded(ResourceInfo),
    /// The resource is about to be freed.
    Deleted(ResourceInfo),
    /// The cache started shutting down.
    ShuttingDown,
}

impl ResourceEvent {
    /// Resource the event is about, `None` for cache-wide events.
    pub fn info(&self) -> Option<&ResourceInfo> {
        match self {
            Self::Exists(info)
            | Self::Loaded(info)
            | Self::LoadFailed(info)
            | Self::Reloaded(info)
            | Self::Deleted(info) => Some(info),
            Self::ShuttingDown => None,
        }
    }
}

/// Id of a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription #{}", self.0)
    }
}

/// Event callback.
pub type EventCallback = Box<dyn FnMut(&ResourceEvent) + Send>;

enum Subscriber {
    Callback(EventCallback),
    Channel(Sender<ResourceEvent>),
}

impl Subscriber {
    /// Returns false once the subscriber can no longer receive events.
    fn notify(&mut self, event: &ResourceEvent) -> bool {
        match self {
            Self::Callback(callback) => {
                callback(event);
                true
            }
            Self::Channel(sender) => sender.send(event.clone()).is_ok(),
        }
    }
}

type Subscribers = Vec<(SubscriptionId, Subscriber)>;

#[derive(Default)]
pub(crate) struct EventDispatcher {
    next_id: u64,
    global: Subscribers,
    per_resource: HashMap<ResourceKey, Subscribers>,
}

impl EventDispatcher {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub(crate) fn subscribe(&mut self, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id();
        self.global.push((id, Subscriber::Callback(callback)));
        id
    }

    pub(crate) fn subscribe_channel(&mut self, sender: Sender<ResourceEvent>) -> SubscriptionId {
        let id = self.next_id();
        self.global.push((id, Subscriber::Channel(sender)));
        id
    }

    pub(crate) fn subscribe_resource(
        &mut self,
        key: ResourceKey,
        callback: EventCallback,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.per_resource
            .entry(key)
            .or_default()
            .push((id, Subscriber::Callback(callback)));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriber_count();
        self.global.retain(|(sub, _)| *sub != id);
        self.per_resource.retain(|_, subscribers| {
            subscribers.retain(|(sub, _)| *sub != id);
            !subscribers.is_empty()
        });
        self.subscriber_count() != before
    }

    /// Resource subscribers first, then global ones.
    pub(crate) fn broadcast(&mut self, key: Option<ResourceKey>, event: &ResourceEvent) {
        if let Some(key) = key {
            if let Some(subscribers) = self.per_resource.get_mut(&key) {
                subscribers.retain_mut(|(_, subscriber)| subscriber.notify(event));
            }
        }
        self.global
            .retain_mut(|(_, subscriber)| subscriber.notify(event));
    }

    /// Drops the subscriptions to a deleted resource.
    pub(crate) fn forget_resource(&mut self, key: ResourceKey) {
        self.per_resource.remove(&key);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.global.len() + self.per_resource.values().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use slotmap::SlotMap;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> EventCallback {
        let log = log.clone();
        Box::new(move |event| {
            let what = match event {
                ResourceEvent::ShuttingDown => "shutting_down".to_owned(),
                other => other.info().unwrap().id.to_string(),
            };
            log.lock().unwrap().push(format!("{}:{}", name, what));
        })
    }

    #[test]
    fn resource_subscribers_are_notified_first() {
        let mut keys = SlotMap::<ResourceKey, ()>::with_key();
        let key = keys.insert(());
        let log = Arc::new(Mutex::new(vec![]));

        let mut dispatcher = EventDispatcher::default();
        dispatcher.subscribe(recorder(&log, "global"));
        dispatcher.subscribe_resource(key, recorder(&log, "local"));

        let info = ResourceInfo {
            resource_type: ResourceType::from_index(0),
            type_name: Arc::from("texture"),
            id: ResourceId::new("sky.png"),
            state: LoadingState::Loaded,
        };
        dispatcher.broadcast(Some(key), &ResourceEvent::Loaded(info));
        dispatcher.broadcast(None, &ResourceEvent::ShuttingDown);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["local:sky.png", "global:sky.png", "global:shutting_down"]
        );

        dispatcher.forget_resource(key);
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn disconnected_channels_are_dropped() {
        let mut dispatcher = EventDispatcher::default();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let id = dispatcher.subscribe_channel(sender);

        dispatcher.broadcast(None, &ResourceEvent::ShuttingDown);
        assert_eq!(receiver.try_recv().unwrap(), ResourceEvent::ShuttingDown);

        drop(receiver);
        dispatcher.broadcast(None, &ResourceEvent::ShuttingDown);
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert!(!dispatcher.unsubscribe(id));
    }

    #[test]
    fn unsubscribe() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut dispatcher = EventDispatcher::default();
        let id = dispatcher.subscribe(recorder(&log, "global"));
        assert!(dispatcher.unsubscribe(id));
        dispatcher.broadcast(None, &ResourceEvent::ShuttingDown);
        assert!(log.lock().unwrap().is_empty());
    }
}
