//! Serialized SSE emitter
//!
//! Every writer in a session (both output relays, the event reorderer and the
//! finalizer) shares one [`SseEmitter`]. Events are encoded outside the lock;
//! the lock covers exactly one frame's write and flush, so frames from
//! concurrent writers never interleave.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::sink::EventSink;
use super::types::DONE_FRAME;

struct EmitterState {
    sink: Box<dyn EventSink>,
    broken: bool,
    finished: bool,
    on_close: Vec<CancellationToken>,
}

impl EmitterState {
    async fn write_frame(&mut self, frame: Bytes) -> bool {
        if self.broken {
            return false;
        }

        let result = match self.sink.write(frame).await {
            Ok(()) => self.sink.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            debug!("Client stream closed, discarding further frames: {}", e);
            self.broken = true;
            for token in self.on_close.drain(..) {
                token.cancel();
            }
            return false;
        }
        true
    }
}

#[derive(Clone)]
pub struct SseEmitter {
    state: Arc<Mutex<EmitterState>>,
}

impl SseEmitter {
    pub fn new<S>(sink: S) -> Self
    where
        S: EventSink + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(EmitterState {
                sink: Box::new(sink),
                broken: false,
                finished: false,
                on_close: Vec::new(),
            })),
        }
    }

    /// Encode one event as a `data: <json>\n\n` frame.
    pub fn encode<T>(event: &T) -> Result<Bytes, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(event)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\n\n");
        Ok(Bytes::from(frame))
    }

    /// Write one event. Returns whether the frame reached the sink; an event
    /// that fails to serialize is logged and dropped without affecting the
    /// rest of the session.
    pub async fn emit<T>(&self, event: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        let frame = match Self::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to marshal event: {}", e);
                return false;
            }
        };
        let len = frame.len();

        let mut state = self.state.lock().await;
        if state.finished {
            debug!("Dropping event emitted after the stream completed");
            return false;
        }
        let written = state.write_frame(frame).await;
        drop(state);

        if written {
            trace!("Wrote event frame ({} bytes)", len);
        }
        written
    }

    /// Emit `{"time": <now>, <key>: <text>}`.
    pub async fn emit_timestamped(&self, key: &str, text: impl Into<String>) -> bool {
        let mut event = Map::new();
        event.insert(
            "time".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        event.insert(key.to_string(), Value::String(text.into()));
        self.emit(&event).await
    }

    /// Write the `[DONE]` sentinel. Only the first call writes; every later
    /// `emit` or `finish` is refused.
    pub async fn finish(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.finished {
            return false;
        }
        state.finished = true;
        let written = state.write_frame(Bytes::from_static(DONE_FRAME)).await;
        debug!("Wrote DONE event");
        written
    }

    /// Cancel `token` once the sink fails, or right away if it already has.
    pub async fn cancel_on_close(&self, token: CancellationToken) {
        let mut state = self.state.lock().await;
        if state.broken {
            token.cancel();
        } else {
            state.on_close.push(token);
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.finished
    }
}
