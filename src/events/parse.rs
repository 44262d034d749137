//! Frame normalization: raw transport frames into [`StreamEvent`]s.
//!
//! A malformed payload for a known tag is reported as
//! [`FrameOutcome::Malformed`] and an unknown tag as [`FrameOutcome::Unknown`].
//! Neither is an error of the stream itself; the handle logs and drops them.

use anyhow::{bail, Result};
use serde_json::Value;

use super::types::{
    EventTag, RawFrame, ReasoningStep, Source, StatusUpdate, StreamEvent, TaskStep,
    ToolCallFinish, ToolCallStart,
};

/// Result of normalizing one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Event(StreamEvent),
    /// The frame named a known tag (or none at all) but its payload did not decode.
    Malformed { tag: Option<String>, reason: String },
    /// The tag is not part of the event model.
    Unknown { tag: String },
}

// Alternative names for one payload field, in precedence order. Servers
// sometimes send several of them at once; the first present name wins.
const STEP_KEYS: &[&str] = &["step", "currentStep", "current_step"];
const STEP_MESSAGE_KEYS: &[&str] = &["message", "stepMessage", "step_message"];
const DELTA_KEYS: &[&str] = &["delta", "content", "text"];
const ARGUMENT_KEYS: &[&str] = &["arguments", "input", "args"];
const OUTPUT_KEYS: &[&str] = &["output", "result"];
const REASONING_KEYS: &[&str] = &["text", "content", "step"];
const SOURCES_REF_KEYS: &[&str] = &["ref", "sourcesRef", "sources_ref", "id"];
const RESULT_ID_KEYS: &[&str] = &["resultId", "result_id", "documentId", "document_id"];

/// Message used when an `error` frame names no reason.
const UNSPECIFIED_ERROR: &str = "server reported an error";

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn value_field(value: &Value, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .find_map(|key| value.get(*key).filter(|v| !v.is_null()))
        .cloned()
}

fn required_string(value: &Value, keys: &[&str]) -> Result<String> {
    match string_field(value, keys) {
        Some(found) => Ok(found),
        None => bail!("missing string field `{}`", keys[0]),
    }
}

/// `"text"` or `{"message": "text"}`.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(_) => string_field(value, &["message", "detail"]),
        _ => None,
    }
}

/// Human-readable reason of an `error` frame: `message`, then `error` (a
/// string or an object with a `message`), then `detail`.
fn error_message(value: &Value) -> String {
    let found = match value {
        Value::String(text) => Some(text.clone()),
        _ => string_field(value, &["message"])
            .or_else(|| value.get("error").and_then(error_text))
            .or_else(|| string_field(value, &["detail"])),
    };
    found
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| UNSPECIFIED_ERROR.to_string())
}

/// Normalize one raw frame.
pub fn normalize(frame: &RawFrame) -> FrameOutcome {
    let data = frame.data.trim();
    let parsed: Option<Value> = if data.is_empty() {
        None
    } else {
        serde_json::from_str(data).ok()
    };

    // SSE's implicit event type is "message"; treat it as untagged.
    let tag = frame
        .tag
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != "message")
        .map(str::to_string)
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|v| v.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    let Some(tag) = tag else {
        let reason = if parsed.is_none() && !data.is_empty() {
            "payload is not valid JSON"
        } else {
            "frame carries no event tag"
        };
        return FrameOutcome::Malformed {
            tag: None,
            reason: reason.to_string(),
        };
    };

    let Some(known) = EventTag::from_wire(&tag) else {
        return FrameOutcome::Unknown { tag };
    };

    let value = match parsed {
        Some(value) => value,
        // A bare `complete` needs no payload.
        None if data.is_empty() && known == EventTag::Complete => Value::Object(Default::default()),
        // A terminal failure is never dropped; plain text is its message.
        None if known == EventTag::Error => Value::String(data.to_string()),
        None => {
            return FrameOutcome::Malformed {
                tag: Some(tag),
                reason: if data.is_empty() {
                    "empty payload".to_string()
                } else {
                    "payload is not valid JSON".to_string()
                },
            }
        }
    };

    match decode(known, value) {
        Ok(event) => FrameOutcome::Event(event),
        Err(e) => FrameOutcome::Malformed {
            tag: Some(tag),
            reason: e.to_string(),
        },
    }
}

fn decode(tag: EventTag, value: Value) -> Result<StreamEvent> {
    let event = match tag {
        EventTag::Status => {
            let Some(progress) = value.get("progress").and_then(Value::as_f64) else {
                bail!("missing numeric field `progress`");
            };
            StreamEvent::Status(StatusUpdate {
                progress: clamp_progress(progress),
                step: TaskStep::from_wire(&required_string(&value, STEP_KEYS)?),
                message: string_field(&value, STEP_MESSAGE_KEYS).unwrap_or_default(),
            })
        }
        EventTag::ContentDelta => StreamEvent::ContentDelta(required_string(&value, DELTA_KEYS)?),
        EventTag::ToolCallStarted => StreamEvent::ToolCallStarted(ToolCallStart {
            id: required_string(&value, &["id"])?,
            name: required_string(&value, &["name"])?,
            arguments: value_field(&value, ARGUMENT_KEYS).unwrap_or(Value::Null),
        }),
        EventTag::ToolCallCompleted => StreamEvent::ToolCallCompleted(ToolCallFinish {
            id: required_string(&value, &["id"])?,
            name: string_field(&value, &["name"]),
            output: value_field(&value, OUTPUT_KEYS),
            error: value.get("error").and_then(error_text),
        }),
        EventTag::ReasoningStep => StreamEvent::ReasoningStep(ReasoningStep {
            title: string_field(&value, &["title"]),
            text: required_string(&value, REASONING_KEYS)?,
        }),
        EventTag::Sources => StreamEvent::Sources(parse_sources(value)?),
        EventTag::SourcesRef => {
            let reference = required_string(&value, SOURCES_REF_KEYS)?;
            if reference.trim().is_empty() {
                bail!("sources_ref carries an empty reference");
            }
            StreamEvent::SourcesRef(reference)
        }
        EventTag::Complete => StreamEvent::Complete {
            result_id: string_field(&value, RESULT_ID_KEYS).filter(|id| !id.is_empty()),
        },
        EventTag::Error => StreamEvent::Error {
            message: error_message(&value),
        },
    };
    Ok(event)
}

/// Decode a citation batch, either `{"sources": [...]}` or a bare array.
///
/// Shared with the `sources_ref` follow-up fetch, which returns the same shape.
pub fn parse_sources(value: Value) -> Result<Vec<Source>> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("sources") {
            Some(Value::Array(entries)) => entries,
            _ => bail!("expected a list of sources or an object with a `sources` list"),
        },
        _ => bail!("expected a list of sources or an object with a `sources` list"),
    };

    let mut sources = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<Source>(entry) {
            Ok(source) => sources.push(source),
            Err(e) => tracing::warn!(index, "dropping unreadable citation: {e}"),
        }
    }
    Ok(sources)
}

fn clamp_progress(raw: f64) -> u8 {
    // Truncation is safe: the value is clamped to 0..=100 first.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamped = raw.clamp(0.0, 100.0).round() as u8;
    clamped
}
