//! Normalized event types carried by a session stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One undecoded frame as delivered by a transport.
///
/// `tag` is the SSE `event:` field when present; otherwise the tag is read
/// from the `type` field of the JSON payload during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub tag: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl RawFrame {
    pub fn new(tag: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            data: data.into(),
            id: None,
        }
    }

    /// A frame with no `event:` field.
    pub fn untagged(data: impl Into<String>) -> Self {
        Self {
            tag: None,
            data: data.into(),
            id: None,
        }
    }
}

/// The closed set of tags a stream may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    Status,
    ContentDelta,
    ToolCallStarted,
    ToolCallCompleted,
    ReasoningStep,
    Sources,
    SourcesRef,
    Complete,
    Error,
}

impl EventTag {
    pub const ALL: [EventTag; 9] = [
        EventTag::Status,
        EventTag::ContentDelta,
        EventTag::ToolCallStarted,
        EventTag::ToolCallCompleted,
        EventTag::ReasoningStep,
        EventTag::Sources,
        EventTag::SourcesRef,
        EventTag::Complete,
        EventTag::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventTag::Status => "status",
            EventTag::ContentDelta => "content_delta",
            EventTag::ToolCallStarted => "tool_call_started",
            EventTag::ToolCallCompleted => "tool_call_completed",
            EventTag::ReasoningStep => "reasoning_step",
            EventTag::Sources => "sources",
            EventTag::SourcesRef => "sources_ref",
            EventTag::Complete => "complete",
            EventTag::Error => "error",
        }
    }

    /// Look up a wire tag. Matching is exact; servers send lowercase tags.
    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == raw)
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named step of the document ingestion pipeline.
///
/// Serialized as its wire name. Step names outside the known pipeline are
/// kept verbatim as [`TaskStep::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStep {
    #[default]
    Queued,
    Upload,
    Parse,
    Extract,
    Chunk,
    Embed,
    Index,
    Finalize,
    Other(String),
}

impl TaskStep {
    /// Map a server step name onto the pipeline. Unrecognized names are kept
    /// as [`TaskStep::Other`] so a new server-side step never breaks a stream.
    pub fn from_wire(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "queued" | "pending" => TaskStep::Queued,
            "upload" | "uploading" => TaskStep::Upload,
            "parse" | "parsing" => TaskStep::Parse,
            "extract" | "extracting" => TaskStep::Extract,
            "chunk" | "chunking" => TaskStep::Chunk,
            "embed" | "embedding" => TaskStep::Embed,
            "index" | "indexing" => TaskStep::Index,
            "finalize" | "finalizing" => TaskStep::Finalize,
            _ => TaskStep::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStep::Queued => "queued",
            TaskStep::Upload => "upload",
            TaskStep::Parse => "parse",
            TaskStep::Extract => "extract",
            TaskStep::Chunk => "chunk",
            TaskStep::Embed => "embed",
            TaskStep::Index => "index",
            TaskStep::Finalize => "finalize",
            TaskStep::Other(name) => name,
        }
    }
}

impl From<String> for TaskStep {
    fn from(raw: String) -> Self {
        TaskStep::from_wire(&raw)
    }
}

impl From<TaskStep> for String {
    fn from(step: TaskStep) -> Self {
        match step {
            TaskStep::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retrieved-source citation.
///
/// Fields beyond the common ones are passed through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Source {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            url: None,
            snippet: None,
            score: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Progress update for a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Already clamped to `0..=100`.
    pub progress: u8,
    pub step: TaskStep,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallStart {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallFinish {
    pub id: String,
    pub name: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningStep {
    pub title: Option<String>,
    pub text: String,
}

/// One normalized inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status(StatusUpdate),
    ContentDelta(String),
    ToolCallStarted(ToolCallStart),
    ToolCallCompleted(ToolCallFinish),
    ReasoningStep(ReasoningStep),
    Sources(Vec<Source>),
    /// Citation batch that must be fetched out-of-band before reduction.
    SourcesRef(String),
    Complete { result_id: Option<String> },
    Error { message: String },
}

impl StreamEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            StreamEvent::Status(_) => EventTag::Status,
            StreamEvent::ContentDelta(_) => EventTag::ContentDelta,
            StreamEvent::ToolCallStarted(_) => EventTag::ToolCallStarted,
            StreamEvent::ToolCallCompleted(_) => EventTag::ToolCallCompleted,
            StreamEvent::ReasoningStep(_) => EventTag::ReasoningStep,
            StreamEvent::Sources(_) => EventTag::Sources,
            StreamEvent::SourcesRef(_) => EventTag::SourcesRef,
            StreamEvent::Complete { .. } => EventTag::Complete,
            StreamEvent::Error { .. } => EventTag::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }
}
