/// Listener registry
///
/// Every live subscription is registered here so the whole set can be torn
/// down before a reconnection episode. The registry owns the unsubscribe
/// functions; callers only hold a [`ListenerHandle`] that can cancel its own
/// entry and learn when the entry is gone.
use crate::driver::{DriverError, Unsubscribe};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use uuid::Uuid;

struct ActiveListener {
    unsubscribe: Unsubscribe,
    /// Dropped together with the entry, which wakes the handle's `torn_down()`
    _teardown: oneshot::Sender<()>,
}

type ListenerSet = Mutex<HashMap<Uuid, ActiveListener>>;

fn lock(set: &ListenerSet) -> MutexGuard<'_, HashMap<Uuid, ActiveListener>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one unsubscribe, logging a failure instead of returning it
fn run_unsubscribe(id: Uuid, listener: ActiveListener) -> Result<(), DriverError> {
    let result = (listener.unsubscribe)();
    if let Err(e) = &result {
        tracing::warn!(listener = %id, error = %e, "Listener unsubscribe failed");
    }
    result
}

/// Set of active listeners
#[derive(Default)]
pub struct ListenerRegistry {
    active: Arc<ListenerSet>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription and return the handle that cancels it
    pub fn register(&self, unsubscribe: Unsubscribe) -> ListenerHandle {
        let id = Uuid::new_v4();
        let (teardown_tx, teardown_rx) = oneshot::channel();

        lock(&self.active).insert(
            id,
            ActiveListener {
                unsubscribe,
                _teardown: teardown_tx,
            },
        );
        tracing::debug!(listener = %id, "Listener registered");

        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.active),
            teardown: Some(teardown_rx),
        }
    }

    /// Unsubscribe every active listener and clear the set
    ///
    /// A failing unsubscribe is logged and does not stop the others. Safe to
    /// call repeatedly. Returns how many listeners were removed.
    pub fn cancel_all(&self) -> usize {
        // Drain under the lock, unsubscribe outside it
        let drained: Vec<(Uuid, ActiveListener)> = lock(&self.active).drain().collect();
        let count = drained.len();

        let failures = drained
            .into_iter()
            .map(|(id, listener)| run_unsubscribe(id, listener))
            .filter(Result::is_err)
            .count();

        if count > 0 {
            tracing::info!(cancelled = count, failures, "Cancelled all listeners");
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-side handle for a registered listener
pub struct ListenerHandle {
    id: Uuid,
    registry: Weak<ListenerSet>,
    teardown: Option<oneshot::Receiver<()>>,
}

impl ListenerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the registry still holds this listener
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|set| lock(&set).contains_key(&self.id))
            .unwrap_or(false)
    }

    /// Unsubscribe and remove this listener
    ///
    /// Idempotent: a listener already removed (by an earlier cancel or a mass
    /// cleanup) is left alone and `Ok(())` is returned.
    pub fn cancel(&self) -> Result<(), DriverError> {
        let Some(set) = self.registry.upgrade() else {
            return Ok(());
        };
        let removed = lock(&set).remove(&self.id);

        match removed {
            Some(listener) => run_unsubscribe(self.id, listener),
            None => Ok(()),
        }
    }

    /// Resolve once this listener has left the registry for any reason
    pub async fn torn_down(&mut self) {
        if let Some(rx) = self.teardown.as_mut() {
            let _ = rx.await;
            self.teardown = None;
        }
    }
}
