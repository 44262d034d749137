//! Insertion-ordered session registry.

use std::collections::HashMap;

use super::traits::{Session, SessionFilter};

/// In-memory map of session id to session, iterated in insertion order.
///
/// Replacing an id moves it to the end, so a superseding session lists after
/// the sessions that were already running.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    order: Vec<String>,
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any existing entry with the same id.
    pub fn insert(&mut self, session: Session) -> Option<Session> {
        let previous = self.sessions.remove(&session.id);
        if previous.is_some() {
            self.order.retain(|id| id != &session.id);
        }
        self.order.push(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
        previous
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Replace the session stored under `id` with `f(session)`, keeping its position.
    ///
    /// Returns `None` when `id` is not registered.
    pub fn replace_with<T>(&mut self, id: &str, f: impl FnOnce(Session) -> (Session, T)) -> Option<T> {
        let current = self.sessions.remove(id)?;
        let (next, out) = f(current);
        debug_assert_eq!(next.id, id, "a session may not change its id");
        self.sessions.insert(id.to_string(), next);
        Some(out)
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let removed = self.sessions.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Sessions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn filtered(&self, filter: SessionFilter) -> impl Iterator<Item = &Session> {
        self.iter().filter(move |s| filter.matches(s.status))
    }

    /// Non-terminal sessions.
    pub fn active(&self) -> impl Iterator<Item = &Session> {
        self.filtered(SessionFilter::Active)
    }

    pub fn terminal(&self) -> impl Iterator<Item = &Session> {
        self.filtered(SessionFilter::Terminal)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.sessions.clear();
    }
}
