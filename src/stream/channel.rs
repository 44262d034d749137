//! In-process transport driven by the caller. Used by tests and demos.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{FrameStream, SourcesResolver, StreamTransport};
use crate::events::{RawFrame, Source};

type FrameSender = mpsc::UnboundedSender<Result<RawFrame>>;

#[derive(Default)]
struct Slot {
    connections: Vec<FrameSender>,
    /// Frames pushed while no connection was open; flushed to the next open.
    backlog: VecDeque<Result<RawFrame>>,
    opens: usize,
    refusal: Option<String>,
}

/// A [`StreamTransport`] whose frames are pushed by hand.
///
/// Frames pushed to a reference go to every live connection for it, or wait
/// in a backlog until one opens.
#[derive(Default, Clone)]
pub struct ChannelTransport {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, stream_ref: &str, frame: RawFrame) {
        self.send(stream_ref, Ok(frame));
    }

    /// Push a tagged frame with a JSON payload.
    pub fn push_event(&self, stream_ref: &str, tag: &str, payload: serde_json::Value) {
        self.push_frame(stream_ref, RawFrame::new(tag, payload.to_string()));
    }

    /// Push a tagged frame with an arbitrary (possibly invalid) payload.
    pub fn push_raw(&self, stream_ref: &str, tag: &str, data: &str) {
        self.push_frame(stream_ref, RawFrame::new(tag, data));
    }

    /// Fail the stream with a transport error.
    pub fn fail(&self, stream_ref: &str, message: &str) {
        self.send(stream_ref, Err(anyhow!("{message}")));
    }

    /// End every live connection for `stream_ref`.
    pub fn end(&self, stream_ref: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(stream_ref) {
            slot.connections.clear();
        }
    }

    /// Make subsequent opens of `stream_ref` fail with `message`.
    pub fn refuse(&self, stream_ref: &str, message: &str) {
        self.slots
            .lock()
            .entry(stream_ref.to_string())
            .or_default()
            .refusal = Some(message.to_string());
    }

    /// How many times `stream_ref` has been opened.
    pub fn open_count(&self, stream_ref: &str) -> usize {
        self.slots.lock().get(stream_ref).map_or(0, |s| s.opens)
    }

    /// Connections for `stream_ref` whose receiving side is still alive.
    pub fn live_connections(&self, stream_ref: &str) -> usize {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(stream_ref) else {
            return 0;
        };
        slot.connections.retain(|tx| !tx.is_closed());
        slot.connections.len()
    }

    fn send(&self, stream_ref: &str, item: Result<RawFrame>) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(stream_ref.to_string()).or_default();
        slot.connections.retain(|tx| !tx.is_closed());

        match slot.connections.as_slice() {
            [] => slot.backlog.push_back(item),
            [only] => {
                let _ = only.send(item);
            }
            many => {
                // anyhow::Error is not Clone; fan out errors by message.
                for tx in many {
                    let copy = match &item {
                        Ok(frame) => Ok(frame.clone()),
                        Err(e) => Err(anyhow!("{e}")),
                    };
                    let _ = tx.send(copy);
                }
            }
        }
    }
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn open(&self, stream_ref: &str) -> Result<FrameStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(stream_ref.to_string()).or_default();
            if let Some(reason) = &slot.refusal {
                return Err(anyhow!("{reason}"));
            }
            slot.opens += 1;
            while let Some(item) = slot.backlog.pop_front() {
                let _ = tx.send(item);
            }
            slot.connections.push(tx);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Resolves `sources_ref` from a fixed table.
#[derive(Default)]
pub struct StaticSourcesResolver {
    batches: Mutex<HashMap<String, Vec<Source>>>,
}

impl StaticSourcesResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &str, sources: Vec<Source>) {
        self.batches.lock().insert(reference.to_string(), sources);
    }
}

#[async_trait]
impl SourcesResolver for StaticSourcesResolver {
    async fn resolve(&self, reference: &str) -> Result<Vec<Source>> {
        self.batches
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("unknown sources reference '{reference}'"))
    }

    fn name(&self) -> &str {
        "static"
    }
}
