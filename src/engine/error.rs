use crate::sessions::{SessionKind, SessionStatus};

/// Invalid caller input to the engine API.
///
/// Stream failures are never reported here; they reach listeners as
/// sessions with `status = error`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("stream reference must not be empty")]
    EmptyStreamRef,

    #[error("seed state is for a {actual} session, expected {expected}")]
    KindMismatch {
        expected: SessionKind,
        actual: SessionKind,
    },

    #[error("session '{id}' is already {status}")]
    Terminal { id: String, status: SessionStatus },

    #[error("session snapshot unavailable: {0:#}")]
    Persistence(anyhow::Error),
}
