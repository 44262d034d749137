//! Session types shared by the reducer, registry, persistence and engine.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::events::{Source, TaskStep};

/// Which reducer and state shape applies to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Background job, e.g. document ingestion.
    Task,
    /// Conversational answer.
    Exchange,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Task => "task",
            SessionKind::Exchange => "exchange",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(SessionKind::Task),
            "exchange" | "chat" => Ok(SessionKind::Exchange),
            other => bail!("unknown session kind '{other}'. Supported values: task, exchange"),
        }
    }
}

/// Session lifecycle status.
///
/// `Complete`, `Error` and `Cancelled` are terminal: once reached, nothing
/// mutates the session again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Connecting,
    Active,
    Complete,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Error | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Complete => "complete",
            SessionStatus::Error => "error",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated state of a `task` session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    /// 0..=100, non-decreasing for the lifetime of the session.
    pub progress: u8,
    pub current_step: TaskStep,
    #[serde(default)]
    pub step_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Failed,
}

/// A tool invocation made while producing an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry of an exchange's ordered trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceStep {
    Reasoning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        text: String,
    },
    ToolCallStarted {
        id: String,
        name: String,
    },
    ToolCallCompleted {
        id: String,
        name: String,
        ok: bool,
    },
}

/// Accumulated state of an `exchange` session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeState {
    /// Append-only while the session is active.
    pub text: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub steps: Vec<TraceStep>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Kind-specific session payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SessionState {
    Task(TaskState),
    Exchange(ExchangeState),
}

impl SessionState {
    /// Empty state for a fresh session of `kind`.
    pub fn empty(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Task => SessionState::Task(TaskState::default()),
            SessionKind::Exchange => SessionState::Exchange(ExchangeState::default()),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            SessionState::Task(_) => SessionKind::Task,
            SessionState::Exchange(_) => SessionKind::Exchange,
        }
    }

    /// Decode a state payload whose shape is selected by `kind`.
    pub fn from_value(kind: SessionKind, value: serde_json::Value) -> Result<Self> {
        Ok(match kind {
            SessionKind::Task => SessionState::Task(serde_json::from_value(value)?),
            SessionKind::Exchange => SessionState::Exchange(serde_json::from_value(value)?),
        })
    }

    pub fn as_task(&self) -> Option<&TaskState> {
        match self {
            SessionState::Task(state) => Some(state),
            SessionState::Exchange(_) => None,
        }
    }

    pub fn as_exchange(&self) -> Option<&ExchangeState> {
        match self {
            SessionState::Exchange(state) => Some(state),
            SessionState::Task(_) => None,
        }
    }

    /// Human-readable failure message, if the session failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            SessionState::Task(state) => state.error.as_deref(),
            SessionState::Exchange(state) => state.error.as_deref(),
        }
    }
}

/// One tracked unit of streaming work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    /// Server-issued reference used to open (and re-open) the stream.
    pub stream_ref: String,
    pub status: SessionStatus,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A new `pending` session with empty state.
    pub fn new(
        id: impl Into<String>,
        kind: SessionKind,
        stream_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_ref: stream_ref.into(),
            status: SessionStatus::Pending,
            state: SessionState::empty(kind),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status filter for registry listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionFilter {
    #[default]
    All,
    /// Non-terminal sessions.
    Active,
    Terminal,
}

impl SessionFilter {
    pub fn matches(self, status: SessionStatus) -> bool {
        match self {
            SessionFilter::All => true,
            SessionFilter::Active => !status.is_terminal(),
            SessionFilter::Terminal => status.is_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        for status in [
            SessionStatus::Complete,
            SessionStatus::Error,
            SessionStatus::Cancelled,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
        for status in [
            SessionStatus::Pending,
            SessionStatus::Connecting,
            SessionStatus::Active,
        ] {
            assert!(!status.is_terminal(), "{status} should not be terminal");
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Task".parse::<SessionKind>().unwrap(), SessionKind::Task);
        assert_eq!("chat".parse::<SessionKind>().unwrap(), SessionKind::Exchange);
        let err = "upload".parse::<SessionKind>().unwrap_err();
        assert!(err.to_string().contains("unknown session kind"));
    }

    #[test]
    fn state_decoding_is_selected_by_kind() {
        let task = json!({"progress": 40, "currentStep": "embed", "stepMessage": "Embedding"});
        let state = SessionState::from_value(SessionKind::Task, task).unwrap();
        assert_eq!(state.as_task().unwrap().current_step, TaskStep::Embed);

        // An exchange payload is not a task payload.
        let exchange = json!({"text": "hi", "sources": []});
        assert!(SessionState::from_value(SessionKind::Task, exchange.clone()).is_err());
        assert!(SessionState::from_value(SessionKind::Exchange, exchange).is_ok());
    }

    #[test]
    fn session_serializes_camel_case() {
        let now = Utc::now();
        let session = Session::new("s1", SessionKind::Task, "t1", now);
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["streamRef"], "t1");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["state"]["progress"], 0);
        assert_eq!(value["state"]["currentStep"], "queued");
    }

    #[test]
    fn filter_matches_status_groups() {
        assert!(SessionFilter::Active.matches(SessionStatus::Connecting));
        assert!(!SessionFilter::Active.matches(SessionStatus::Cancelled));
        assert!(SessionFilter::Terminal.matches(SessionStatus::Error));
        assert!(SessionFilter::All.matches(SessionStatus::Pending));
    }
}
