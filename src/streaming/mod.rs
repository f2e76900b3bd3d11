//! Ordered event-streaming bridge
//!
//! Turns a running tool's stdout, stderr and optional JSON event channel into
//! one server-sent-event stream. Concurrent writers share a single
//! [`SseEmitter`]; the [`finalize`] step runs after every writer has drained
//! and always ends the stream with `data: [DONE]`.

pub mod emitter;
pub mod finalize;
pub mod framer;
pub mod relay;
pub mod reorder;
pub mod session;
pub mod sink;
pub mod types;


pub use emitter::SseEmitter;
pub use finalize::{finalize, TerminalOutcome};
pub use framer::{drop_cr, frames, Frame, FrameReader};
pub use relay::{drain_stream, relay_output, RelayHandle, RelayStats};
pub use reorder::{parse_event_line, pump_events, spawn_reorderer, stream_events, EventReorderer};
pub use session::StreamSession;
pub use sink::{BodyChunk, ChannelSink, EventSink, WriterSink};
pub use types::{
    event_type, run_id, Event, ReorderPolicy, StreamSource, StreamingConfig, CALL_CONFIRM,
    DONE_FRAME, RUN_ID_KEY, TYPE_KEY,
};
