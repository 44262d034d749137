//! The session engine: owns the registry, the open stream handles and the
//! snapshot store, and is the only writer of all three.
//!
//! Every inbound event passes the same pipeline under the engine lock:
//! 1. stale-id guard: the session is no longer registered
//! 2. terminal-status guard
//! 3. replaced-handle guard: the event came from a handle that was closed
//! 4. reducer
//! 5. listener notification (queued; delivered in order by the notifier task)
//! 6. persistence snapshot of the non-terminal sessions

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::EngineError;
use super::listeners::{ListenerHandle, ListenerList};
use crate::events::StreamEvent;
use crate::observability::metrics::outcome;
use crate::observability::EngineMetrics;
use crate::persistence::{self, SnapshotStore};
use crate::sessions::{
    generate_session_id, reduce, Applied, Session, SessionFilter, SessionKind, SessionRegistry,
    SessionState, SessionStatus,
};
use crate::stream::{
    EventSink, FrameDrop, HandleConfig, SourcesResolver, StreamHandle, StreamTransport,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Close a stream that stays silent this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Discard persisted sessions last updated longer ago than this on restore.
    pub max_snapshot_age: Option<chrono::Duration>,
}

/// Optional starting point for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    /// Caller-assigned id. Reusing a registered id supersedes that session.
    pub id: Option<String>,
    /// Initial state; must match the session kind.
    pub state: Option<SessionState>,
}

impl SessionSeed {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            state: None,
        }
    }
}

#[derive(Default)]
struct EngineInner {
    registry: SessionRegistry,
    handles: HashMap<String, StreamHandle>,
    restored: bool,
}

impl EngineInner {
    fn open_handles(&self) -> usize {
        self.handles.values().filter(|h| h.is_open()).count()
    }
}

pub(crate) struct EngineCore {
    inner: Mutex<EngineInner>,
    transport: Arc<dyn StreamTransport>,
    resolver: Arc<dyn SourcesResolver>,
    store: Arc<dyn SnapshotStore>,
    listeners: Arc<ListenerList>,
    changes: mpsc::UnboundedSender<Session>,
    metrics: Arc<EngineMetrics>,
    options: EngineOptions,
    next_generation: AtomicU64,
}

/// Handle-side view of the engine. Holds it weakly so open handles never
/// keep a dropped engine alive.
struct WeakSink(Weak<EngineCore>);

impl EventSink for WeakSink {
    fn deliver(&self, session_id: &str, generation: u64, event: StreamEvent) {
        if let Some(core) = self.0.upgrade() {
            core.apply(session_id, generation, event);
        }
    }

    fn frame_dropped(&self, _session_id: &str, _generation: u64, reason: FrameDrop) {
        if let Some(core) = self.0.upgrade() {
            core.metrics.frame(reason.as_str());
        }
    }
}

impl EngineCore {
    fn apply(&self, session_id: &str, generation: u64, event: StreamEvent) {
        let tag = event.tag();
        let mut inner = self.inner.lock();

        let Some(current) = inner.registry.get(session_id) else {
            tracing::debug!(session_id, tag = %tag, "dropping event for unknown session");
            self.metrics.frame(outcome::STALE);
            return;
        };
        if current.is_terminal() {
            tracing::debug!(
                session_id,
                tag = %tag,
                status = %current.status,
                "dropping event for terminal session"
            );
            self.metrics.frame(outcome::REJECTED_TERMINAL);
            return;
        }
        let live_generation = inner.handles.get(session_id).map(StreamHandle::generation);
        if live_generation != Some(generation) {
            tracing::debug!(session_id, generation, tag = %tag, "dropping event from replaced handle");
            self.metrics.frame(outcome::STALE);
            return;
        }

        let now = Utc::now();
        let Some((applied, snapshot)) = inner.registry.replace_with(session_id, |prior| {
            let (next, applied) = reduce(prior, event, now);
            let snapshot = next.clone();
            (next, (applied, snapshot))
        }) else {
            return;
        };

        if let Applied::Ignored(reason) = applied {
            tracing::debug!(session_id, tag = %tag, reason, "event ignored by reducer");
            self.metrics.frame(outcome::IGNORED);
            return;
        }
        tracing::debug!(session_id, tag = %tag, status = %snapshot.status, "event applied");
        self.metrics.frame(outcome::APPLIED);

        if snapshot.is_terminal() {
            inner.handles.remove(session_id);
            self.metrics.session_finished(snapshot.status);
            self.metrics.set_open_handles(inner.open_handles());
            match snapshot.state.error() {
                Some(error) => tracing::info!(session_id, error, "session failed"),
                None => tracing::info!(session_id, status = %snapshot.status, "session finished"),
            }
        }

        self.notify(snapshot);
        self.persist(&inner);
    }

    fn subscribe_locked(
        self: &Arc<Self>,
        inner: &mut EngineInner,
        session_id: &str,
    ) -> Result<(), EngineError> {
        let session = inner
            .registry
            .get(session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        if session.is_terminal() {
            return Err(EngineError::Terminal {
                id: session_id.to_string(),
                status: session.status,
            });
        }
        let stream_ref = session.stream_ref.clone();

        if let Some(previous) = inner.handles.remove(session_id) {
            tracing::debug!(session_id, generation = previous.generation(), "replacing stream handle");
            previous.close();
        }

        let now = Utc::now();
        let snapshot = inner
            .registry
            .replace_with(session_id, |mut s| {
                if s.status != SessionStatus::Connecting {
                    s.status = SessionStatus::Connecting;
                    s.updated_at = now;
                }
                let snapshot = s.clone();
                (s, snapshot)
            })
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = StreamHandle::open(
            session_id,
            &stream_ref,
            generation,
            Arc::clone(&self.transport),
            Arc::clone(&self.resolver),
            Arc::new(WeakSink(Arc::downgrade(self))),
            HandleConfig {
                idle_timeout: self.options.idle_timeout,
            },
        );
        inner.handles.insert(session_id.to_string(), handle);
        self.metrics.set_open_handles(inner.open_handles());

        tracing::info!(session_id, stream_ref = %stream_ref, generation, "subscribed");
        self.notify(snapshot);
        self.persist(inner);
        Ok(())
    }

    fn notify(&self, snapshot: Session) {
        if self.changes.send(snapshot).is_err() {
            tracing::debug!("change notifier stopped; dropping notification");
        }
    }

    fn persist(&self, inner: &EngineInner) {
        let result = persistence::encode(inner.registry.active())
            .and_then(|payload| self.store.save(&payload));
        if let Err(e) = result {
            tracing::warn!(store = self.store.name(), key = self.store.key(), "failed to persist sessions: {e:#}");
        }
    }
}

/// Session engine. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Must be called within a tokio runtime: the engine spawns a task that
    /// delivers change notifications.
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        resolver: Arc<dyn SourcesResolver>,
        store: Arc<dyn SnapshotStore>,
        options: EngineOptions,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("the session engine requires a tokio runtime")?;
        let metrics = Arc::new(EngineMetrics::new()?);
        let listeners = Arc::new(ListenerList::default());
        let (changes, mut rx) = mpsc::unbounded_channel::<Session>();

        let notifier_listeners = Arc::clone(&listeners);
        runtime.spawn(async move {
            while let Some(session) = rx.recv().await {
                notifier_listeners.notify(&session);
            }
        });

        tracing::debug!(
            transport = transport.name(),
            resolver = resolver.name(),
            store = store.name(),
            "session engine ready"
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                inner: Mutex::new(EngineInner::default()),
                transport,
                resolver,
                store,
                listeners,
                changes,
                metrics,
                options,
                next_generation: AtomicU64::new(0),
            }),
        })
    }

    /// Register a new session and subscribe to its stream. Returns its id.
    pub fn start(
        &self,
        kind: SessionKind,
        stream_ref: &str,
        seed: SessionSeed,
    ) -> Result<String, EngineError> {
        let stream_ref = stream_ref.trim();
        if stream_ref.is_empty() {
            return Err(EngineError::EmptyStreamRef);
        }
        if let Some(state) = &seed.state {
            if state.kind() != kind {
                return Err(EngineError::KindMismatch {
                    expected: kind,
                    actual: state.kind(),
                });
            }
        }

        let id = seed
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_session_id(kind));
        let mut session = Session::new(id.clone(), kind, stream_ref, Utc::now());
        if let Some(state) = seed.state {
            session.state = state;
        }

        let mut inner = self.core.inner.lock();
        if let Some(previous) = inner.handles.remove(&id) {
            previous.close();
        }
        if let Some(previous) = inner.registry.insert(session) {
            tracing::info!(
                session_id = %id,
                previous_ref = %previous.stream_ref,
                previous_status = %previous.status,
                "session superseded"
            );
        }
        tracing::info!(session_id = %id, kind = %kind, stream_ref, "session started");
        self.core.subscribe_locked(&mut inner, &id)?;
        Ok(id)
    }

    /// Open a fresh stream handle for a registered session, closing any
    /// handle it already has.
    pub fn subscribe(&self, session_id: &str) -> Result<(), EngineError> {
        let mut inner = self.core.inner.lock();
        self.core.subscribe_locked(&mut inner, session_id)
    }

    /// Close the session's stream and mark it cancelled.
    ///
    /// Cancelling a session that is already terminal is a no-op.
    pub fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        let mut inner = self.core.inner.lock();
        let session = inner
            .registry
            .get(session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        if session.is_terminal() {
            tracing::debug!(session_id, status = %session.status, "cancel on terminal session ignored");
            return Ok(());
        }

        if let Some(handle) = inner.handles.remove(session_id) {
            handle.close();
        }
        let now = Utc::now();
        let snapshot = inner
            .registry
            .replace_with(session_id, |mut s| {
                s.status = SessionStatus::Cancelled;
                s.updated_at = now;
                let snapshot = s.clone();
                (s, snapshot)
            })
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;

        self.core.metrics.session_finished(SessionStatus::Cancelled);
        self.core.metrics.set_open_handles(inner.open_handles());
        tracing::info!(session_id, "session cancelled");
        self.core.notify(snapshot);
        self.core.persist(&inner);
        Ok(())
    }

    /// Re-register and resubscribe the sessions persisted by a previous
    /// process. Runs once; later calls return no ids.
    pub fn restore(&self) -> Result<Vec<String>, EngineError> {
        let mut inner = self.core.inner.lock();
        if inner.restored {
            return Ok(Vec::new());
        }
        let payload = self.core.store.load().map_err(EngineError::Persistence)?;
        inner.restored = true;

        let Some(payload) = payload else {
            tracing::debug!(key = self.core.store.key(), "no session snapshot to restore");
            return Ok(Vec::new());
        };

        let sessions = persistence::decode(&payload, Utc::now(), self.core.options.max_snapshot_age);
        let mut restored = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            if inner.registry.contains(&session.id) {
                tracing::debug!(session_id = %session.id, "session already registered; not restoring");
                continue;
            }
            let id = session.id.clone();
            session.status = SessionStatus::Connecting;
            inner.registry.insert(session);
            match self.core.subscribe_locked(&mut inner, &id) {
                Ok(()) => restored.push(id),
                Err(e) => tracing::warn!(session_id = %id, "failed to resubscribe restored session: {e}"),
            }
        }

        self.core.persist(&inner);
        tracing::info!(count = restored.len(), key = self.core.store.key(), "sessions restored");
        Ok(restored)
    }

    /// Register `listener` for every session change.
    pub fn on_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let id = self.core.listeners.add(Arc::new(listener));
        ListenerHandle::new(id, &self.core.listeners)
    }

    pub fn listener_count(&self) -> usize {
        self.core.listeners.len()
    }

    /// Dismiss a session, closing its stream. Later events for it are stale.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.core.inner.lock();
        if let Some(handle) = inner.handles.remove(session_id) {
            handle.close();
        }
        let removed = inner.registry.remove(session_id)?;
        self.core.metrics.set_open_handles(inner.open_handles());
        self.core.persist(&inner);
        tracing::info!(session_id, status = %removed.status, "session removed");
        Some(removed)
    }

    /// Remove every terminal session. Returns the removed ids.
    pub fn clear_terminal(&self) -> Vec<String> {
        let mut inner = self.core.inner.lock();
        let ids: Vec<String> = inner.registry.terminal().map(|s| s.id.clone()).collect();
        for id in &ids {
            inner.registry.remove(id);
            inner.handles.remove(id);
        }
        if !ids.is_empty() {
            self.core.persist(&inner);
            tracing::info!(count = ids.len(), "terminal sessions cleared");
        }
        ids
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.core.inner.lock().registry.get(session_id).cloned()
    }

    /// Sessions in registration order.
    pub fn list(&self, filter: SessionFilter) -> Vec<Session> {
        self.core
            .inner
            .lock()
            .registry
            .filtered(filter)
            .cloned()
            .collect()
    }

    pub fn active(&self) -> Vec<Session> {
        self.list(SessionFilter::Active)
    }

    pub fn open_handle_count(&self) -> usize {
        self.core.inner.lock().open_handles()
    }

    /// Close every open handle. Sessions keep their status and snapshot, so
    /// a later [`Engine::restore`] in a new process resumes them.
    pub fn shutdown(&self) {
        let mut inner = self.core.inner.lock();
        let count = inner.handles.len();
        for (_, handle) in inner.handles.drain() {
            handle.close();
        }
        self.core.metrics.set_open_handles(0);
        tracing::info!(closed = count, "session engine shut down");
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.core.metrics)
    }
}

#[cfg(test)]
impl Engine {
    /// Deliver `event` as if it came from the session's current handle.
    pub(crate) fn inject(&self, session_id: &str, event: StreamEvent) {
        let generation = self
            .core
            .inner
            .lock()
            .handles
            .get(session_id)
            .map_or(0, StreamHandle::generation);
        self.core.apply(session_id, generation, event);
    }

    /// Deliver `event` as if it came from the handle with `generation`.
    pub(crate) fn inject_from(&self, session_id: &str, generation: u64, event: StreamEvent) {
        self.core.apply(session_id, generation, event);
    }

    pub(crate) fn handle_generation(&self, session_id: &str) -> Option<u64> {
        self.core
            .inner
            .lock()
            .handles
            .get(session_id)
            .map(StreamHandle::generation)
    }
}
