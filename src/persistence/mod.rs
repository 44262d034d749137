pub mod file;
pub mod in_memory;
pub mod snapshot;
pub mod sqlite;
pub mod traits;

pub use file::FileSnapshotStore;
pub use in_memory::InMemorySnapshotStore;
pub use snapshot::{decode, encode, PersistedSession};
pub use sqlite::SqliteSnapshotStore;
pub use traits::SnapshotStore;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::config::PersistenceConfig;

/// Database file used by the sqlite backend inside the state directory.
pub const SQLITE_FILE: &str = "sessions.db";

/// Namespaced per-tab storage key.
pub fn snapshot_key(namespace: &str, tab: &str) -> String {
    format!("{namespace}:{tab}")
}

/// Build the configured snapshot store rooted at `state_dir`.
pub fn create_snapshot_store(
    config: &PersistenceConfig,
    state_dir: &Path,
) -> Result<Arc<dyn SnapshotStore>> {
    let key = snapshot_key(&config.namespace, &config.tab);
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteSnapshotStore::open(
            &state_dir.join(SQLITE_FILE),
            &key,
        )?)),
        "file" => Ok(Arc::new(FileSnapshotStore::new(state_dir, &key)?)),
        "memory" => Ok(Arc::new(InMemorySnapshotStore::new(&key))),
        other => anyhow::bail!("Unknown persistence backend '{other}'. Supported: sqlite, file, memory"),
    }
}
