//! One live connection for one session.
//!
//! A handle owns a background task that reads frames, normalizes them,
//! resolves `sources_ref` batches and hands the results to an [`EventSink`].
//! Frames are processed strictly one at a time, so a resolved batch is
//! delivered before any later frame of the same stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::traits::{
    EventSink, FrameDrop, FrameStream, HandleState, SourcesResolver, StreamTransport,
};
use crate::events::{normalize, FrameOutcome, RawFrame, StreamEvent};

#[derive(Debug, Clone, Copy, Default)]
pub struct HandleConfig {
    /// Fail the stream when no frame arrives for this long.
    pub idle_timeout: Option<Duration>,
}

pub struct StreamHandle {
    session_id: String,
    generation: u64,
    state: Arc<Mutex<HandleState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamHandle {
    /// Start connecting to `stream_ref`. Must be called within a tokio runtime.
    pub fn open(
        session_id: &str,
        stream_ref: &str,
        generation: u64,
        transport: Arc<dyn StreamTransport>,
        resolver: Arc<dyn SourcesResolver>,
        sink: Arc<dyn EventSink>,
        config: HandleConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(HandleState::Connecting));
        let pump = Pump {
            session_id: session_id.to_string(),
            stream_ref: stream_ref.to_string(),
            generation,
            state: Arc::clone(&state),
            resolver,
            sink,
            idle_timeout: config.idle_timeout,
        };
        let task = tokio::spawn(pump.run(transport));

        Self {
            session_id: session_id.to_string(),
            generation,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> HandleState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        !self.state().is_closed()
    }

    /// Stop the connection. Nothing is delivered after this returns.
    ///
    /// Idempotent; a handle that already closed on its own keeps its state.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if !state.is_closed() {
                *state = HandleState::ClosedNormal;
                tracing::debug!(
                    session_id = %self.session_id,
                    generation = self.generation,
                    "stream handle closed"
                );
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

struct Pump {
    session_id: String,
    stream_ref: String,
    generation: u64,
    state: Arc<Mutex<HandleState>>,
    resolver: Arc<dyn SourcesResolver>,
    sink: Arc<dyn EventSink>,
    idle_timeout: Option<Duration>,
}

impl Pump {
    async fn run(self, transport: Arc<dyn StreamTransport>) {
        let mut frames = match transport.open(&self.stream_ref).await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    transport = transport.name(),
                    "stream open failed: {e:#}"
                );
                self.finish(
                    HandleState::ClosedError,
                    StreamEvent::error(format!("failed to open stream: {e:#}")),
                );
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            *state = HandleState::Open;
        }
        tracing::debug!(
            session_id = %self.session_id,
            generation = self.generation,
            "stream open"
        );

        loop {
            let frame = match self.next_frame(&mut frames).await {
                Ok(frame) => frame,
                Err(message) => {
                    tracing::warn!(session_id = %self.session_id, "{message}");
                    self.finish(HandleState::ClosedError, StreamEvent::error(message));
                    return;
                }
            };

            let event = match normalize(&frame) {
                FrameOutcome::Event(event) => event,
                FrameOutcome::Malformed { tag, reason } => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        tag = tag.as_deref().unwrap_or("-"),
                        "dropping malformed frame: {reason}"
                    );
                    self.dropped(FrameDrop::Malformed);
                    continue;
                }
                FrameOutcome::Unknown { tag } => {
                    tracing::warn!(session_id = %self.session_id, tag = %tag, "dropping frame with unknown tag");
                    self.dropped(FrameDrop::UnknownTag);
                    continue;
                }
            };

            let event = match event {
                StreamEvent::SourcesRef(reference) => match self.resolver.resolve(&reference).await {
                    Ok(sources) => StreamEvent::Sources(sources),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %self.session_id,
                            reference = %reference,
                            "sources resolution failed: {e:#}"
                        );
                        self.dropped(FrameDrop::ResolutionFailed);
                        continue;
                    }
                },
                other => other,
            };

            if event.is_terminal() {
                let closed = match event {
                    StreamEvent::Error { .. } => HandleState::ClosedError,
                    _ => HandleState::ClosedNormal,
                };
                self.finish(closed, event);
                return;
            }

            if self.state.lock().is_closed() {
                return;
            }
            self.sink.deliver(&self.session_id, self.generation, event);
        }
    }

    /// Wait for the next frame, mapping every way the stream can stop into a message.
    async fn next_frame(&self, frames: &mut FrameStream) -> Result<RawFrame, String> {
        let next = match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                Ok(next) => next,
                Err(_) => return Err(format!("stream idle for {limit:?}")),
            },
            None => frames.next().await,
        };

        match next {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(format!("stream interrupted: {e:#}")),
            None => Err("stream ended before completion".to_string()),
        }
    }

    /// Record the final state, then deliver the terminal event.
    ///
    /// Nothing is delivered if the handle was closed from outside first.
    fn finish(&self, closed: HandleState, event: StreamEvent) {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return;
            }
            *state = closed;
        }
        self.sink.deliver(&self.session_id, self.generation, event);
    }

    fn dropped(&self, reason: FrameDrop) {
        self.sink
            .frame_dropped(&self.session_id, self.generation, reason);
    }
}
