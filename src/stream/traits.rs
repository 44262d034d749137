//! Transport seams for server-push streams.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::events::{RawFrame, Source, StreamEvent};

/// Frames of one open connection. An `Err` item is a transport failure.
pub type FrameStream = BoxStream<'static, Result<RawFrame>>;

/// Opens server-push connections addressed by a stream reference.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a connection. Resolves once the server has accepted it.
    async fn open(&self, stream_ref: &str) -> Result<FrameStream>;

    /// The name of this transport implementation.
    fn name(&self) -> &str;
}

/// Resolves citation batches delivered out-of-band (`sources_ref`).
#[async_trait]
pub trait SourcesResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Vec<Source>>;

    fn name(&self) -> &str;
}

/// Why a handle dropped a frame without delivering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDrop {
    Malformed,
    UnknownTag,
    ResolutionFailed,
}

impl FrameDrop {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameDrop::Malformed => "malformed",
            FrameDrop::UnknownTag => "unknown",
            FrameDrop::ResolutionFailed => "resolution_failed",
        }
    }
}

/// Receives normalized events from stream handles.
///
/// `generation` identifies the handle that produced the event, so the owner
/// can discard events from a handle it has already replaced.
pub trait EventSink: Send + Sync {
    fn deliver(&self, session_id: &str, generation: u64, event: StreamEvent);

    fn frame_dropped(&self, _session_id: &str, _generation: u64, _reason: FrameDrop) {}
}

/// Stream handle lifecycle: `idle → connecting → open → closed-*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Connecting,
    Open,
    ClosedNormal,
    ClosedError,
}

impl HandleState {
    pub fn is_closed(self) -> bool {
        matches!(self, HandleState::ClosedNormal | HandleState::ClosedError)
    }
}
