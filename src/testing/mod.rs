//! Testing utilities and fixtures
//!
//! In-memory sinks that record what a session wrote, plus helpers for
//! splitting the recorded bytes back into SSE frames.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::streaming::EventSink;

#[derive(Default)]
struct Recorded {
    bytes: Vec<u8>,
    flushes: usize,
}

/// Sink that keeps every byte written to it. Clones share the same buffer,
/// so a test can hand one clone to an emitter and inspect the other.
#[derive(Clone, Default)]
pub struct RecordingSink {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything written so far, decoded lossily.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.recorded().bytes).to_string()
    }

    pub fn flush_count(&self) -> usize {
        self.recorded().flushes
    }

    /// Payloads of all frames written so far, including `[DONE]`.
    pub fn frames(&self) -> Vec<String> {
        parse_frames(&self.contents())
    }

    /// JSON payloads of all frames written so far, excluding `[DONE]`.
    pub fn events(&self) -> Vec<Value> {
        parse_events(&self.contents())
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn write(&mut self, frame: Bytes) -> io::Result<()> {
        self.recorded().bytes.extend_from_slice(&frame);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.recorded().flushes += 1;
        Ok(())
    }
}

/// Sink whose every write fails as if the client hung up.
#[derive(Clone, Default)]
pub struct FailingSink {
    attempts: Arc<Mutex<usize>>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventSink for FailingSink {
    async fn write(&mut self, _frame: Bytes) -> io::Result<()> {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))
    }
}

/// Split an SSE body into frame payloads (the text after `data: `).
pub fn parse_frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| chunk.strip_prefix("data: ").unwrap_or(chunk).to_string())
        .collect()
}

/// Parse every JSON frame in an SSE body, skipping the `[DONE]` sentinel.
pub fn parse_events(body: &str) -> Vec<Value> {
    parse_frames(body)
        .into_iter()
        .filter(|payload| payload != "[DONE]")
        .filter_map(|payload| serde_json::from_str(&payload).ok())
        .collect()
}
