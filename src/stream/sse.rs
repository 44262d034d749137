//! Server-Sent Events decoding.
//!
//! Bytes are buffered until a full line is available, so a multi-byte UTF-8
//! character split across network chunks still decodes correctly. Lines are
//! assembled into frames at each blank line:
//! - `data:` lines accumulate (joined with `\n`)
//! - `event:` and `id:` set the frame's tag and id
//! - `retry:`, unknown fields and `:` comments are ignored
//! - a `[DONE]` payload is a sentinel, not a frame

use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};

use super::traits::FrameStream;
use crate::events::RawFrame;

/// Incremental decoder from SSE bytes to [`RawFrame`]s.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        // The buffered tail never holds a newline, so only the new bytes are searched.
        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        let mut start = 0;
        let mut frames = Vec::new();

        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let raw = &self.buffer[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
            start = end + 1;
            search_from = start;
        }

        self.buffer.drain(..start);
        frames
    }

    /// Flush at end of stream: a trailing unterminated line and any pending frame.
    pub fn finish(&mut self) -> Option<RawFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // retry and unknown fields
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawFrame> {
        let tag = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() && tag.is_none() {
            return None;
        }

        let data = self.data.join("\n");
        self.data.clear();

        if data.trim() == "[DONE]" {
            return None;
        }

        Some(RawFrame { tag, data, id })
    }
}

struct DecodeState<S> {
    inner: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<RawFrame>,
    done: bool,
}

/// Adapt a byte stream (e.g. `reqwest::Response::bytes_stream`) into frames.
///
/// A read error is yielded once as an `Err` item and ends the stream.
pub fn decode_stream<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                return Some((Ok(frame), st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    let frames = st.decoder.push(chunk.as_ref());
                    st.pending.extend(frames);
                }
                Some(Err(e)) => {
                    st.done = true;
                    let err = anyhow::Error::new(e).context("stream read failed");
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
