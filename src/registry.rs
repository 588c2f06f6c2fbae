//! Process-wide registry of active listeners.
//!
//! Every listener registers its stop handle here on start and removes it
//! on stop; `shutdown_all` is the single entry point a host process wires
//! its termination signal to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::listener::ListenerHandle;

struct RegistryInner {
    listeners: Mutex<Vec<ListenerHandle>>,
    next_id: AtomicU64,
}

/// Ordered collection of active listener handles.
///
/// Mutations take a synchronous lock and never span an await point, so
/// register/unregister are atomic with respect to the cooperative
/// scheduler.
#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, handle: ListenerHandle) {
        self.inner.listeners.lock().push(handle);
    }

    /// Remove a listener by id. A no-op when the entry is already gone,
    /// which makes concurrent stop-during-shutdown safe.
    pub(crate) fn unregister(&self, id: u64) {
        self.inner.listeners.lock().retain(|handle| handle.id() != id);
    }

    /// Number of currently registered listeners.
    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every registered listener.
    ///
    /// Iterates a snapshot: each handle removes itself, the list is never
    /// cleared wholesale. Individual stop failures are logged by the
    /// handles themselves and cannot block the remaining stops.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<ListenerHandle> = self.inner.listeners.lock().clone();
        if snapshot.is_empty() {
            return;
        }
        tracing::info!(count = snapshot.len(), "stopping all listeners");
        for handle in snapshot {
            handle.stop().await;
        }
    }
}
