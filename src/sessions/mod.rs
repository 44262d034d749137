//! Tracked units of streaming work, their reducer and the registry.

pub mod reducer;
pub mod registry;
pub mod traits;

pub use reducer::{reduce, Applied};
pub use registry::SessionRegistry;
pub use traits::{
    ExchangeState, Session, SessionFilter, SessionKind, SessionState, SessionStatus, TaskState,
    ToolCall, ToolCallStatus, TraceStep,
};

use uuid::Uuid;

/// Generate an engine-assigned id for an ephemeral session.
pub fn generate_session_id(kind: SessionKind) -> String {
    format!("{kind}_{}", Uuid::new_v4().simple())
}
