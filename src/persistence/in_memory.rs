use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::traits::SnapshotStore;

/// Process-local snapshot store.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    key: String,
    payload: Mutex<Option<String>>,
    writes: Mutex<usize>,
    fail_writes: Mutex<bool>,
}

impl InMemorySnapshotStore {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    /// A store that already holds `payload`.
    pub fn with_payload(key: &str, payload: &str) -> Self {
        let store = Self::new(key);
        *store.payload.lock() = Some(payload.to_string());
        store
    }

    /// The current payload without going through the trait.
    pub fn payload(&self) -> Option<String> {
        self.payload.lock().clone()
    }

    /// Number of successful `save` calls.
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }

    /// Make subsequent saves fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.payload.lock().clone())
    }

    fn save(&self, payload: &str) -> Result<()> {
        if *self.fail_writes.lock() {
            bail!("snapshot store is read-only");
        }
        *self.payload.lock() = Some(payload.to_string());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.payload.lock() = None;
        Ok(())
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        "memory"
    }
}
