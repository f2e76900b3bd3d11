//! Core types for the streaming bridge

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A structured event as read from a tool's event channel.
pub type Event = Map<String, Value>;

/// Key carrying the identifier of the run that produced an event.
pub const RUN_ID_KEY: &str = "runID";

/// Key carrying an event's semantic class.
pub const TYPE_KEY: &str = "type";

/// Event class that must not reach the client before its run's earlier events.
pub const CALL_CONFIRM: &str = "callConfirm";

/// Terminal SSE frame.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Stream source identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    /// JSON key the source's frames are emitted under.
    pub fn key(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

/// Normalized run identifier of an event: strings verbatim, absent or null
/// as the empty string, anything else as its JSON text.
pub fn run_id(event: &Event) -> String {
    match event.get(RUN_ID_KEY) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
    }
}

/// The event's `type`, when it is a string.
pub fn event_type(event: &Event) -> Option<&str> {
    event.get(TYPE_KEY).and_then(Value::as_str)
}

/// Which events are held back and what happens to held events at end of stream.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReorderPolicy {
    /// Event types that open a hold window when their run differs from the
    /// last released one.
    pub deferred_types: BTreeSet<String>,
    /// Release events still held when the event stream closes. When false
    /// they are dropped (and logged).
    pub flush_on_close: bool,
}

impl Default for ReorderPolicy {
    fn default() -> Self {
        Self {
            deferred_types: BTreeSet::from([CALL_CONFIRM.to_string()]),
            flush_on_close: true,
        }
    }
}

impl ReorderPolicy {
    pub fn defers(&self, event: &Event) -> bool {
        event_type(event).is_some_and(|t| self.deferred_types.contains(t))
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Read buffer size in bytes; bounds the size of one output frame.
    pub read_buffer_size: usize,
    /// Frames queued between a session and its HTTP body.
    pub channel_capacity: usize,
    pub reorder: ReorderPolicy,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            channel_capacity: 64,
            reorder: ReorderPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> Event {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test events are objects"),
        }
    }

    #[test]
    fn test_run_id_normalization() {
        assert_eq!(run_id(&event(json!({"runID": "abc"}))), "abc");
        assert_eq!(run_id(&event(json!({"runID": 7}))), "7");
        assert_eq!(run_id(&event(json!({"runID": null}))), "");
        assert_eq!(run_id(&event(json!({"type": "x"}))), "");
    }

    #[test]
    fn test_default_policy_defers_confirm_only() {
        let policy = ReorderPolicy::default();
        assert!(policy.defers(&event(json!({"type": "callConfirm"}))));
        assert!(!policy.defers(&event(json!({"type": "callStart"}))));
        assert!(!policy.defers(&event(json!({"type": 1}))));
        assert!(policy.flush_on_close);
    }

    #[test]
    fn test_streaming_config_partial_toml() {
        let config: StreamingConfig = toml::from_str(
            r#"
            read_buffer_size = 1024

            [reorder]
            flush_on_close = false
            "#,
        )
        .unwrap();

        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.channel_capacity, 64);
        assert!(!config.reorder.flush_on_close);
        assert!(config.reorder.deferred_types.contains(CALL_CONFIRM));
    }
}
