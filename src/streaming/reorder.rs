//! Causal event reorderer
//!
//! Holds back a confirmation event (or any deferred type, see
//! [`ReorderPolicy`]) whose run has not been seen yet, together with
//! everything that arrives after it, until an event from the most recently
//! held run shows up. Held events are then released in arrival order ahead
//! of that event. Events are delayed, never reordered relative to each other.
//!
//! The buffer and the last run id belong to a single task; producers only
//! talk to it through a channel.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument, Span};

use super::emitter::SseEmitter;
use super::framer::drop_cr;
use super::types::{run_id, Event, ReorderPolicy};

const EVENT_QUEUE_DEPTH: usize = 64;

pub struct EventReorderer {
    policy: ReorderPolicy,
    buffer: Vec<Event>,
    last_run_id: String,
}

impl EventReorderer {
    pub fn new(policy: ReorderPolicy) -> Self {
        Self {
            policy,
            buffer: Vec::new(),
            last_run_id: String::new(),
        }
    }

    /// Feed one event and return the events it releases, in emit order.
    pub fn accept(&mut self, event: Event) -> Vec<Event> {
        let run = run_id(&event);

        if (!self.buffer.is_empty() || self.policy.defers(&event)) && run != self.last_run_id {
            self.buffer.push(event);
            self.last_run_id = run;
            return Vec::new();
        }

        let mut released = std::mem::take(&mut self.buffer);
        released.push(event);
        self.last_run_id = run;
        released
    }

    /// Number of events currently held back.
    pub fn held(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_run_id(&self) -> &str {
        &self.last_run_id
    }

    /// End of stream: release whatever is still held, or drop it when the
    /// policy says so.
    pub fn finish(self) -> Vec<Event> {
        if self.policy.flush_on_close {
            if !self.buffer.is_empty() {
                debug!("Releasing {} held events at end of stream", self.buffer.len());
            }
            self.buffer
        } else {
            if !self.buffer.is_empty() {
                warn!(
                    "Dropping {} held events at end of stream (last run {:?})",
                    self.buffer.len(),
                    self.last_run_id
                );
            }
            Vec::new()
        }
    }
}

/// Start the reorderer task. Send events into the returned channel and drop
/// it to end the stream; the handle resolves to the number of events emitted.
pub fn spawn_reorderer(
    emitter: SseEmitter,
    policy: ReorderPolicy,
) -> (mpsc::Sender<Event>, JoinHandle<usize>) {
    let (sender, mut receiver) = mpsc::channel::<Event>(EVENT_QUEUE_DEPTH);

    let handle = tokio::spawn(
        async move {
            let mut reorderer = EventReorderer::new(policy);
            let mut emitted = 0;

            while let Some(event) = receiver.recv().await {
                for released in reorderer.accept(event) {
                    emitter.emit(&released).await;
                    emitted += 1;
                }
            }

            for released in reorderer.finish() {
                emitter.emit(&released).await;
                emitted += 1;
            }
            emitted
        }
        .instrument(Span::current()),
    );

    (sender, handle)
}

/// Parse one line of the event stream. Blank lines and anything that is not
/// a JSON object yield `None`; the latter are logged.
pub fn parse_event_line(line: &[u8]) -> Option<Event> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = drop_cr(line);
    if line.is_empty() {
        return None;
    }

    match serde_json::from_slice::<Event>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            error!(
                "Failed to unmarshal event: {} (event: {})",
                e,
                String::from_utf8_lossy(line)
            );
            None
        }
    }
}

/// Read newline-delimited JSON events and forward them to the reorderer.
/// Returns the number of events forwarded.
pub async fn pump_events<R>(reader: R, events: &mpsc::Sender<Event>) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut forwarded = 0;

    debug!("Receiving events");
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read event stream: {}", e);
                break;
            }
        }

        let Some(event) = parse_event_line(&line) else {
            continue;
        };
        if events.send(event).await.is_err() {
            warn!("Event reorderer stopped before the event stream ended");
            break;
        }
        forwarded += 1;
    }
    debug!("Done receiving events ({} forwarded)", forwarded);

    forwarded
}

/// Run a whole event stream through a fresh reorderer onto `emitter`.
/// Returns the number of events emitted.
pub async fn stream_events<R>(emitter: &SseEmitter, reader: R, policy: ReorderPolicy) -> usize
where
    R: AsyncRead + Unpin,
{
    let (sender, handle) = spawn_reorderer(emitter.clone(), policy);
    pump_events(reader, &sender).await;
    drop(sender);

    match handle.await {
        Ok(emitted) => emitted,
        Err(e) => {
            error!("Event reorderer task failed: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::types::CALL_CONFIRM;
    use crate::testing::RecordingSink;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn event(value: Value) -> Event {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test events are objects"),
        }
    }

    fn ev(run: &str, kind: &str) -> Event {
        event(json!({"runID": run, "type": kind}))
    }

    fn feed(reorderer: &mut EventReorderer, events: Vec<Event>) -> Vec<Event> {
        events
            .into_iter()
            .flat_map(|e| reorderer.accept(e))
            .collect()
    }

    #[test]
    fn test_confirm_follows_same_run_event() {
        let mut reorderer = EventReorderer::new(ReorderPolicy::default());
        let input = vec![ev("1", "x"), ev("1", CALL_CONFIRM), ev("2", "y")];

        let released = feed(&mut reorderer, input.clone());

        assert_eq!(released, input);
        assert_eq!(reorderer.held(), 0);
        assert_eq!(reorderer.last_run_id(), "2");
    }

    #[test]
    fn test_confirm_for_unseen_run_is_held() {
        let mut reorderer = EventReorderer::new(ReorderPolicy::default());

        assert!(reorderer.accept(ev("1", CALL_CONFIRM)).is_empty());
        assert_eq!(reorderer.held(), 1);

        let released = reorderer.accept(ev("1", "callProgress"));
        assert_eq!(released, vec![ev("1", CALL_CONFIRM), ev("1", "callProgress")]);
        assert_eq!(reorderer.held(), 0);
    }

    #[test]
    fn test_hold_window_follows_latest_run() {
        let mut reorderer = EventReorderer::new(ReorderPolicy::default());

        assert!(reorderer.accept(ev("2", CALL_CONFIRM)).is_empty());
        assert!(reorderer.accept(ev("3", "a")).is_empty());
        assert_eq!(reorderer.held(), 2);

        let released = reorderer.accept(ev("3", "b"));
        assert_eq!(
            released,
            vec![ev("2", CALL_CONFIRM), ev("3", "a"), ev("3", "b")]
        );
    }

    #[test]
    fn test_held_events_flushed_at_close_by_default() {
        let mut reorderer = EventReorderer::new(ReorderPolicy::default());
        assert_eq!(reorderer.accept(ev("1", "x")).len(), 1);
        assert!(reorderer.accept(ev("2", CALL_CONFIRM)).is_empty());

        assert_eq!(reorderer.finish(), vec![ev("2", CALL_CONFIRM)]);
    }

    #[test]
    fn test_held_events_dropped_at_close_when_configured() {
        let policy = ReorderPolicy {
            flush_on_close: false,
            ..ReorderPolicy::default()
        };
        let mut reorderer = EventReorderer::new(policy);
        assert_eq!(reorderer.accept(ev("1", "x")).len(), 1);
        assert!(reorderer.accept(ev("2", CALL_CONFIRM)).is_empty());

        assert!(reorderer.finish().is_empty());
    }

    #[test]
    fn test_extra_deferred_types() {
        let mut policy = ReorderPolicy::default();
        policy.deferred_types.insert("callPrompt".to_string());
        let mut reorderer = EventReorderer::new(policy);

        assert!(reorderer.accept(ev("7", "callPrompt")).is_empty());
        assert_eq!(reorderer.accept(ev("7", "callStart")).len(), 2);
    }

    #[test]
    fn test_missing_run_id_matches_initial_state() {
        let mut reorderer = EventReorderer::new(ReorderPolicy::default());
        // No runID normalizes to "", the same as the initial last run id
        let released = reorderer.accept(event(json!({"type": CALL_CONFIRM})));
        assert_eq!(released.len(), 1);
    }

    #[test]
    fn test_parse_event_line() {
        assert_eq!(
            parse_event_line(b"{\"runID\":\"1\"}\r\n"),
            Some(event(json!({"runID": "1"})))
        );
        assert_eq!(parse_event_line(b"\n"), None);
        assert_eq!(parse_event_line(b"not json\n"), None);
        assert_eq!(parse_event_line(b"[1,2]\n"), None);
    }

    #[tokio::test]
    async fn test_stream_events_skips_malformed_lines() {
        let sink = RecordingSink::new();
        let emitter = SseEmitter::new(sink.clone());
        let input = concat!(
            "{\"runID\":\"1\",\"type\":\"callStart\"}\n",
            "garbage\n",
            "\n",
            "{\"runID\":\"1\",\"type\":\"callConfirm\"}\r\n",
            "{\"runID\":\"2\",\"type\":\"callStart\"}"
        );

        let emitted = stream_events(&emitter, input.as_bytes(), ReorderPolicy::default()).await;

        assert_eq!(emitted, 3);
        let types: Vec<String> = sink
            .events()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["callStart", "callConfirm", "callStart"]);
    }

    #[tokio::test]
    async fn test_stream_events_passes_payload_through() {
        let sink = RecordingSink::new();
        let emitter = SseEmitter::new(sink.clone());
        let input = "{\"runID\":\"r\",\"type\":\"callFinish\",\"output\":{\"n\":[1,2]}}\n";

        stream_events(&emitter, input.as_bytes(), ReorderPolicy::default()).await;

        assert_eq!(
            sink.events(),
            vec![json!({"runID": "r", "type": "callFinish", "output": {"n": [1, 2]}})]
        );
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        (0u8..4, prop_oneof![Just("callConfirm"), Just("callStart"), Just("callFinish")])
            .prop_map(|(run, kind)| ev(&run.to_string(), kind))
    }

    proptest! {
        #[test]
        fn test_flushing_reorderer_preserves_arrival_order(
            events in prop::collection::vec(arb_event(), 0..40),
        ) {
            let mut reorderer = EventReorderer::new(ReorderPolicy::default());
            let mut released = feed(&mut reorderer, events.clone());
            released.extend(reorderer.finish());
            prop_assert_eq!(released, events);
        }

        #[test]
        fn test_dropping_reorderer_releases_a_prefix(
            events in prop::collection::vec(arb_event(), 0..40),
        ) {
            let policy = ReorderPolicy { flush_on_close: false, ..ReorderPolicy::default() };
            let mut reorderer = EventReorderer::new(policy);
            let mut released = feed(&mut reorderer, events.clone());
            released.extend(reorderer.finish());
            prop_assert!(released.len() <= events.len());
            prop_assert_eq!(&events[..released.len()], &released[..]);
        }

        #[test]
        fn test_release_requires_run_of_last_held_event(
            events in prop::collection::vec(arb_event(), 1..40),
        ) {
            let mut reorderer = EventReorderer::new(ReorderPolicy::default());
            for event in events {
                let held_before = reorderer.held();
                let last_before = reorderer.last_run_id().to_string();
                let run = run_id(&event);
                let released = reorderer.accept(event);

                if held_before > 0 && !released.is_empty() {
                    prop_assert_eq!(run, last_before);
                }
                if !released.is_empty() {
                    prop_assert_eq!(reorderer.held(), 0);
                    prop_assert_eq!(released.len(), held_before + 1);
                }
            }
        }
    }
}
