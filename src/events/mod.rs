//! Event model: the closed set of frames a session stream can carry.

pub mod parse;
pub mod types;

pub use parse::{normalize, parse_sources, FrameOutcome};
pub use types::{
    EventTag, RawFrame, ReasoningStep, Source, StatusUpdate, StreamEvent, TaskStep,
    ToolCallFinish, ToolCallStart,
};
