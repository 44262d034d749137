//! Stream transports, SSE decoding and per-session stream handles.

pub mod channel;
pub mod handle;
pub mod http;
pub mod sse;
pub mod traits;

pub use channel::{ChannelTransport, StaticSourcesResolver};
pub use handle::{HandleConfig, StreamHandle};
pub use http::HttpTransport;
pub use sse::{decode_stream, SseDecoder};
pub use traits::{
    EventSink, FrameDrop, FrameStream, HandleState, SourcesResolver, StreamTransport,
};
