use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::State;

/// Subscriber callback, invoked with `(uid, delta)` after every effective change.
pub type SubscriberFn = Arc<dyn Fn(&str, &State) + Send + Sync>;

/// Durable recording hook. Errors are logged and otherwise ignored.
pub type HistoryFn = Arc<dyn Fn(&str, &State) -> anyhow::Result<()> + Send + Sync>;

type SubscriberMap = RwLock<HashMap<u64, SubscriberFn>>;

/// In-memory map of device UID to State with change fan-out.
///
/// Merges for the same UID are serialized by the state lock. Subscribers and
/// the history sink run after every lock is released, so a subscriber may
/// call back into the store.
pub struct StateStore {
    states: Mutex<HashMap<String, State>>,
    subscribers: Arc<SubscriberMap>,
    next_subscriber_id: AtomicU64,
    history: RwLock<Option<HistoryFn>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
            history: RwLock::new(None),
        }
    }

    /// Current state for `uid`, or an empty record if the UID is unknown.
    pub fn get(&self, uid: &str) -> State {
        self.states.lock().get(uid).cloned().unwrap_or_default()
    }

    /// Merge `patch` into the state for `uid`. Returns `true` if any field
    /// changed; subscribers are only notified in that case.
    pub fn update(&self, uid: &str, patch: State) -> bool {
        let delta = {
            let mut states = self.states.lock();
            let current = states.entry(uid.to_string()).or_default();
            match current.merge(&patch) {
                Some((merged, delta)) => {
                    *current = merged;
                    delta
                }
                None => return false,
            }
        };

        debug!(uid = %uid, delta = ?delta, "State updated");

        let history = self.history.read().clone();
        if let Some(history) = history {
            if let Err(e) = history(uid, &delta) {
                warn!(uid = %uid, error = %e, "History callback failed");
            }
        }

        let subscribers: Vec<SubscriberFn> = self.subscribers.read().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(uid, &delta);
        }

        true
    }

    /// Registers a change subscriber. Dropping or calling
    /// [`Subscription::unsubscribe`] on the handle removes it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &State) + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn set_history_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &State) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.history.write() = Some(Arc::new(callback));
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribe handle returned by [`StateStore::subscribe`].
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().remove(&self.id);
        }
    }
}
