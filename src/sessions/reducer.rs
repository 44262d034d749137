//! The session reducer: `(prior, event) -> next`.
//!
//! This is the only code that changes a session's `state`. It performs no I/O
//! and expects a non-terminal session; the engine rejects events for terminal
//! sessions before they get here.

use chrono::{DateTime, Utc};

use super::traits::{
    ExchangeState, Session, SessionState, SessionStatus, TaskState, ToolCall, ToolCallStatus,
    TraceStep,
};
use crate::events::{StreamEvent, ToolCallFinish, ToolCallStart};

/// Whether an event changed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// The event does not apply to this session; the reason is for logging.
    Ignored(&'static str),
}

/// Fold one event into `prior`, stamping `at` as the update time when it applies.
pub fn reduce(prior: Session, event: StreamEvent, at: DateTime<Utc>) -> (Session, Applied) {
    let mut next = prior;
    let applied = match (&mut next.state, event) {
        (SessionState::Exchange(state), StreamEvent::ContentDelta(delta)) => {
            state.text.push_str(&delta);
            Applied::Changed
        }
        (SessionState::Task(state), StreamEvent::Status(update)) => {
            // Progress never moves backwards within one session.
            state.progress = state.progress.max(update.progress);
            state.current_step = update.step;
            state.step_message = update.message;
            Applied::Changed
        }
        (SessionState::Exchange(state), StreamEvent::Sources(sources)) => {
            state.sources = sources;
            Applied::Changed
        }
        (SessionState::Exchange(state), StreamEvent::ToolCallStarted(start)) => {
            record_tool_start(state, start);
            Applied::Changed
        }
        (SessionState::Exchange(state), StreamEvent::ToolCallCompleted(finish)) => {
            record_tool_finish(state, finish);
            Applied::Changed
        }
        (SessionState::Exchange(state), StreamEvent::ReasoningStep(step)) => {
            state.steps.push(TraceStep::Reasoning {
                title: step.title,
                text: step.text,
            });
            Applied::Changed
        }
        (_, StreamEvent::SourcesRef(_)) => Applied::Ignored("sources_ref must be resolved first"),
        (state, StreamEvent::Complete { result_id }) => {
            if let SessionState::Task(TaskState { result_id: slot, .. }) = state {
                if result_id.is_some() {
                    *slot = result_id;
                }
            }
            next.status = SessionStatus::Complete;
            Applied::Changed
        }
        (state, StreamEvent::Error { message }) => {
            match state {
                SessionState::Task(task) => task.error = Some(message),
                SessionState::Exchange(exchange) => exchange.error = Some(message),
            }
            next.status = SessionStatus::Error;
            Applied::Changed
        }
        (SessionState::Task(_), _) => Applied::Ignored("event applies to exchange sessions only"),
        (SessionState::Exchange(_), StreamEvent::Status(_)) => {
            Applied::Ignored("status applies to task sessions only")
        }
    };

    if applied == Applied::Changed {
        if matches!(
            next.status,
            SessionStatus::Pending | SessionStatus::Connecting
        ) {
            next.status = SessionStatus::Active;
        }
        next.updated_at = at;
    }
    (next, applied)
}

fn record_tool_start(state: &mut ExchangeState, start: ToolCallStart) {
    state.steps.push(TraceStep::ToolCallStarted {
        id: start.id.clone(),
        name: start.name.clone(),
    });
    state.tool_calls.push(ToolCall {
        id: start.id,
        name: start.name,
        arguments: start.arguments,
        status: ToolCallStatus::Running,
        output: None,
        error: None,
    });
}

fn record_tool_finish(state: &mut ExchangeState, finish: ToolCallFinish) {
    let ok = finish.error.is_none();
    let status = if ok {
        ToolCallStatus::Completed
    } else {
        ToolCallStatus::Failed
    };

    let running = state
        .tool_calls
        .iter_mut()
        .rev()
        .find(|call| call.id == finish.id && call.status == ToolCallStatus::Running);

    let name = match running {
        Some(call) => {
            call.status = status;
            call.output = finish.output;
            call.error = finish.error;
            call.name.clone()
        }
        // Completion without a start: keep it in the trace anyway.
        None => {
            let name = finish.name.unwrap_or_default();
            state.tool_calls.push(ToolCall {
                id: finish.id.clone(),
                name: name.clone(),
                arguments: serde_json::Value::Null,
                status,
                output: finish.output,
                error: finish.error,
            });
            name
        }
    };

    state.steps.push(TraceStep::ToolCallCompleted {
        id: finish.id,
        name,
        ok,
    });
}
