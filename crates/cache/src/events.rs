//! Publish/subscribe channel for cache and loading notifications.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{ImageId, VolumeId};

/// Notifications broadcast to the rest of the application.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// An allocation was refused because it would exceed the byte budget.
    CacheSizeExceeded {
        requested: usize,
        available: usize,
        message: String,
    },
    ImageCached { image_id: ImageId, bytes: usize },
    VolumeCached { volume_id: VolumeId, bytes: usize },
    ImageRemoved { image_id: ImageId, bytes: usize },
    VolumeRemoved { volume_id: VolumeId, bytes: usize },
    FrameLoaded {
        volume_id: VolumeId,
        frame_index: usize,
    },
    /// One frame of a volume failed to load. Sibling frames keep loading.
    VolumeLoadFailed {
        volume_id: VolumeId,
        frame_index: usize,
        error: String,
    },
    /// Every outstanding request of a load resolved. `complete` is false
    /// when some frames failed.
    VolumeLoaded {
        volume_id: VolumeId,
        frames_loaded: usize,
        total_frames: usize,
        complete: bool,
    },
    FramesAliased {
        volume_id: VolumeId,
        frames: usize,
        bytes_released: usize,
    },
    FramesRestored {
        volume_id: VolumeId,
        frames: usize,
        bytes_restored: usize,
    },
}

pub type EventListener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

pub type SubscriptionId = u64;

#[derive(Default)]
struct BusState {
    next_id: SubscriptionId,
    listeners: Vec<(SubscriptionId, EventListener)>,
}

/// Cloneable handle to a shared listener list.
///
/// Listeners run on the publishing thread after the bus lock is released, so
/// a listener may publish or subscribe without deadlocking.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: EventListener) -> SubscriptionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.listeners.push((id, listener));
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(sub, _)| *sub != id);
        state.listeners.len() != before
    }

    pub fn publish(&self, event: &CacheEvent) {
        let listeners: Vec<EventListener> = self
            .state
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus) -> (SubscriptionId, Arc<Mutex<Vec<CacheEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(Arc::new(move |event: &CacheEvent| {
            sink.lock().push(event.clone());
        }));
        (id, seen)
    }

    #[test]
    fn test_publish_reaches_all_listeners() {
        let bus = EventBus::new();
        let (_, first) = recorder(&bus);
        let (_, second) = recorder(&bus);

        bus.publish(&CacheEvent::FrameLoaded {
            volume_id: "vol".into(),
            frame_index: 3,
        });

        assert_eq!(first.lock().len(), 1);
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (id, seen) = recorder(&bus);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(&CacheEvent::ImageRemoved {
            image_id: "img".into(),
            bytes: 4,
        });
        assert!(seen.lock().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_publish() {
        let bus = EventBus::new();
        let (_, seen) = recorder(&bus);
        let inner = bus.clone();
        bus.subscribe(Arc::new(move |event: &CacheEvent| {
            if let CacheEvent::FrameLoaded { volume_id, .. } = event {
                inner.publish(&CacheEvent::VolumeLoaded {
                    volume_id: volume_id.clone(),
                    frames_loaded: 1,
                    total_frames: 1,
                    complete: true,
                });
            }
        }));

        bus.publish(&CacheEvent::FrameLoaded {
            volume_id: "vol".into(),
            frame_index: 0,
        });

        assert_eq!(seen.lock().len(), 2);
    }
}
