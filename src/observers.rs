use crate::errors::{AppError, AppResult};
use crate::models::StoreEvent;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

type Observer = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Delivers committed store changes to registered callbacks and channel subscribers.
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<BTreeMap<u64, Observer>>,
    sender: broadcast::Sender<StoreEvent>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            observers: RwLock::new(BTreeMap::new()),
            sender,
        }
    }

    pub fn subscribe(&self, observer: impl Fn(&StoreEvent) + Send + Sync + 'static) -> AppResult<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers
            .write()
            .map_err(|_| AppError::Internal("observer lock poisoned".to_string()))?
            .insert(id, Arc::new(observer));
        Ok(SubscriptionId(id))
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> AppResult<bool> {
        let removed = self
            .observers
            .write()
            .map_err(|_| AppError::Internal("observer lock poisoned".to_string()))?
            .remove(&id.0);
        Ok(removed.is_some())
    }

    /// Receivers that fall more than the channel capacity behind observe `Lagged`.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().map(|observers| observers.len()).unwrap_or(0)
    }

    pub fn publish(&self, event: StoreEvent) {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let observers: Vec<Observer> = match self.observers.read() {
            Ok(observers) => observers.values().cloned().collect(),
            Err(_) => {
                tracing::warn!("observer lock poisoned; skipping callbacks");
                Vec::new()
            }
        };
        for observer in observers {
            observer(&event);
        }
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn settings_event() -> StoreEvent {
        StoreEvent::SettingsUpdated
    }

    #[test]
    fn callbacks_receive_events_until_unsubscribed() {
        let registry = ObserverRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = registry
            .subscribe(move |event| sink.lock().expect("lock").push(event.clone()))
            .expect("subscribe");
        assert_eq!(registry.observer_count(), 1);

        registry.publish(settings_event());
        assert!(registry.unsubscribe(id).expect("unsubscribe"));
        assert!(!registry.unsubscribe(id).expect("unsubscribe"));
        registry.publish(StoreEvent::CompletionsCleared { removed: 2 });

        assert_eq!(*seen.lock().expect("lock"), vec![settings_event()]);
        assert_eq!(registry.observer_count(), 0);
    }

    #[test]
    fn a_callback_may_unsubscribe_itself() {
        let registry = Arc::new(ObserverRegistry::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(&registry);
        let own_id = slot.clone();
        let counter = calls.clone();
        let id = registry
            .subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let (Some(registry), Some(id)) = (weak.upgrade(), *own_id.lock().expect("lock")) {
                    registry.unsubscribe(id).expect("unsubscribe");
                }
            })
            .expect("subscribe");
        *slot.lock().expect("lock") = Some(id);

        registry.publish(settings_event());
        registry.publish(settings_event());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_subscribers_receive_published_events() {
        let registry = ObserverRegistry::new();
        let mut receiver = registry.subscribe_channel();

        registry.publish(StoreEvent::CategoryCreated { header: "Health".to_string() });

        let event = receiver.recv().await.expect("event");
        assert_eq!(event, StoreEvent::CategoryCreated { header: "Health".to_string() });
    }
}
