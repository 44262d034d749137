//! Snapshot codec: in-flight sessions to and from the persisted JSON list.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sessions::{Session, SessionKind, SessionState, SessionStatus};

/// One persisted entry: `{id, kind, streamRef, status, state, updatedAt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: String,
    pub kind: String,
    pub stream_ref: String,
    pub status: String,
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedSession {
    fn from_session(session: &Session) -> Result<Self> {
        Ok(Self {
            id: session.id.clone(),
            kind: session.kind.as_str().to_string(),
            stream_ref: session.stream_ref.clone(),
            status: session.status.as_str().to_string(),
            state: serde_json::to_value(&session.state)
                .with_context(|| format!("failed to serialize state of session {}", session.id))?,
            created_at: Some(session.created_at),
            updated_at: session.updated_at,
        })
    }

    fn into_session(self, now: DateTime<Utc>, max_age: Option<Duration>) -> Result<Session> {
        if self.id.trim().is_empty() {
            bail!("empty id");
        }
        let kind: SessionKind = self.kind.parse()?;
        if self.stream_ref.trim().is_empty() {
            bail!("empty streamRef");
        }
        let status: SessionStatus = serde_json::from_value(Value::String(self.status.clone()))
            .with_context(|| format!("unknown status '{}'", self.status))?;
        if status.is_terminal() {
            bail!("terminal status '{status}'");
        }
        if let Some(max_age) = max_age {
            if now.signed_duration_since(self.updated_at) > max_age {
                bail!("stale since {}", self.updated_at.to_rfc3339());
            }
        }
        let state = SessionState::from_value(kind, self.state)
            .with_context(|| format!("state does not match kind '{kind}'"))?;

        Ok(Session {
            id: self.id,
            kind,
            stream_ref: self.stream_ref,
            status,
            state,
            created_at: self.created_at.unwrap_or(self.updated_at),
            updated_at: self.updated_at,
        })
    }
}

/// Serialize the non-terminal sessions among `sessions`, in iteration order.
pub fn encode<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> Result<String> {
    let entries = sessions
        .into_iter()
        .filter(|s| !s.is_terminal())
        .map(PersistedSession::from_session)
        .collect::<Result<Vec<_>>>()?;
    serde_json::to_string(&entries).context("failed to serialize session snapshot")
}

/// Decode a snapshot, discarding every entry that is structurally invalid,
/// terminal, or older than `max_age`.
///
/// A payload that is not a JSON list yields no sessions.
pub fn decode(payload: &str, now: DateTime<Utc>, max_age: Option<Duration>) -> Vec<Session> {
    let entries: Vec<Value> = match serde_json::from_str(payload) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("discarding unreadable session snapshot: {e}");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut sessions = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let decoded = serde_json::from_value::<PersistedSession>(entry)
            .map_err(anyhow::Error::from)
            .and_then(|p| p.into_session(now, max_age));
        match decoded {
            Ok(session) if !seen.insert(session.id.clone()) => {
                tracing::warn!(session_id = %session.id, "discarding duplicate snapshot entry");
            }
            Ok(session) => sessions.push(session),
            Err(e) => tracing::warn!(index, "discarding snapshot entry: {e:#}"),
        }
    }
    sessions
}
