use anyhow::Result;

/// Durable slot holding one tab's serialized in-flight sessions.
///
/// Calls are synchronous: the engine invokes them inside its single-writer
/// section, so every write observes the one before it. The last write wins.
pub trait SnapshotStore: Send + Sync {
    /// The stored payload, or `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<String>>;

    /// Overwrite the stored payload.
    fn save(&self, payload: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    /// The namespaced per-tab key this store writes under.
    fn key(&self) -> &str;

    /// The name of this backend.
    fn name(&self) -> &str;
}
