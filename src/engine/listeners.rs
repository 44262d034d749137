//! Change listeners and their registration handles.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::sessions::Session;

/// Callback invoked with the full session after every change.
pub type Listener = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerList {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl ListenerList {
    pub(crate) fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Call every listener with `session`. A panicking listener is logged
    /// and does not stop the others.
    pub(crate) fn notify(&self, session: &Session) {
        // Listeners may register or unsubscribe from inside a callback.
        let listeners: Vec<(u64, Listener)> = self.entries.lock().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(session))).is_err() {
                tracing::warn!(listener = id, session_id = %session.id, "change listener panicked");
            }
        }
    }
}

/// Registration returned by `Engine::on_change`.
///
/// Dropping it unsubscribes the listener. Call [`ListenerHandle::detach`] to
/// keep the listener for the engine's lifetime.
#[must_use = "dropping a ListenerHandle unsubscribes its listener"]
pub struct ListenerHandle {
    id: u64,
    list: Weak<ListenerList>,
    registered: bool,
}

impl ListenerHandle {
    pub(crate) fn new(id: u64, list: &Arc<ListenerList>) -> Self {
        Self {
            id,
            list: Arc::downgrade(list),
            registered: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the listener registered after this handle is gone.
    pub fn detach(mut self) {
        self.registered = false;
    }

    fn release(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Some(list) = self.list.upgrade() {
            list.remove(self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release();
    }
}
