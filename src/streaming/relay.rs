//! Dual-stream relay: stdout and stderr drained concurrently onto one emitter

use serde_json::{Map, Value};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn, Instrument, Span};

use super::emitter::SseEmitter;
use super::framer::FrameReader;
use super::types::StreamSource;

/// Frames relayed per stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub stdout_frames: usize,
    pub stderr_frames: usize,
}

/// Completion handle for a running relay.
pub struct RelayHandle {
    stdout: JoinHandle<usize>,
    stderr: JoinHandle<usize>,
}

impl RelayHandle {
    /// Wait until both streams reached end of file.
    pub async fn join(self) -> RelayStats {
        RelayStats {
            stdout_frames: Self::join_one(self.stdout, StreamSource::Stdout).await,
            stderr_frames: Self::join_one(self.stderr, StreamSource::Stderr).await,
        }
    }

    async fn join_one(task: JoinHandle<usize>, source: StreamSource) -> usize {
        match task.await {
            Ok(frames) => frames,
            Err(e) => {
                error!("{} relay task failed: {}", source.key(), e);
                0
            }
        }
    }
}

/// Spawn one draining task per stream. Order is preserved within a stream;
/// frames from the two streams interleave freely.
pub fn relay_output<O, E>(
    emitter: &SseEmitter,
    stdout: O,
    stderr: E,
    read_buffer_size: usize,
) -> RelayHandle
where
    O: AsyncRead + Send + Unpin + 'static,
    E: AsyncRead + Send + Unpin + 'static,
{
    let span = Span::current();

    let stdout_emitter = emitter.clone();
    let stdout = tokio::spawn(
        async move {
            drain_stream(&stdout_emitter, stdout, StreamSource::Stdout, read_buffer_size).await
        }
        .instrument(span.clone()),
    );

    let stderr_emitter = emitter.clone();
    let stderr = tokio::spawn(
        async move {
            drain_stream(&stderr_emitter, stderr, StreamSource::Stderr, read_buffer_size).await
        }
        .instrument(span),
    );

    RelayHandle { stdout, stderr }
}

/// Emit `{<source>: <frame text>}` for every frame until end of stream.
/// A read error ends the stream; headers are already out, so it is only logged.
pub async fn drain_stream<R>(
    emitter: &SseEmitter,
    reader: R,
    source: StreamSource,
    read_buffer_size: usize,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut framer = FrameReader::new(reader, read_buffer_size);
    let mut relayed = 0;

    while let Some(next) = framer.next_frame().await {
        match next {
            Ok(frame) => {
                let mut event = Map::new();
                event.insert(
                    source.key().to_string(),
                    Value::String(frame.text().into_owned()),
                );
                emitter.emit(&event).await;
                relayed += 1;
                trace!("Relayed {} frame ({} bytes)", source.key(), frame.as_bytes().len());
            }
            Err(e) => warn!("Failed to read {}: {}", source.key(), e),
        }
    }

    debug!("{} drained after {} frames", source.key(), relayed);
    relayed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn texts_for(sink: &RecordingSink, key: &str) -> Vec<String> {
        sink.events()
            .iter()
            .filter_map(|event| event.get(key).and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_relay_tags_frames_by_stream() {
        let sink = RecordingSink::new();
        let emitter = SseEmitter::new(sink.clone());

        let stdout = Builder::new().read(b"out-1").read(b"out-2\r").build();
        let stderr = Builder::new().read(b"err-1").build();

        let stats = relay_output(&emitter, stdout, stderr, 1024).join().await;

        assert_eq!(
            stats,
            RelayStats {
                stdout_frames: 2,
                stderr_frames: 1
            }
        );
        assert_eq!(texts_for(&sink, "stdout"), vec!["out-1", "out-2"]);
        assert_eq!(texts_for(&sink, "stderr"), vec!["err-1"]);
        for event in sink.events() {
            assert_eq!(event.as_object().unwrap().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_interleaves_but_keeps_stream_order() {
        let sink = RecordingSink::new();
        let emitter = SseEmitter::new(sink.clone());

        let stdout = Builder::new()
            .read(b"o1")
            .wait(Duration::from_millis(20))
            .read(b"o2")
            .build();
        let stderr = Builder::new()
            .wait(Duration::from_millis(10))
            .read(b"e1")
            .wait(Duration::from_millis(20))
            .read(b"e2")
            .build();

        relay_output(&emitter, stdout, stderr, 1024).join().await;

        let all: Vec<String> = sink
            .events()
            .iter()
            .map(|event| {
                let (_, value) = event.as_object().unwrap().iter().next().unwrap();
                value.as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(all, vec!["o1", "e1", "o2", "e2"]);
    }

    #[tokio::test]
    async fn test_relay_survives_read_error() {
        let sink = RecordingSink::new();
        let emitter = SseEmitter::new(sink.clone());

        let stdout = Builder::new()
            .read(b"before")
            .read_error(std::io::Error::other("broken pipe"))
            .build();
        let stderr = Builder::new().build();

        let stats = relay_output(&emitter, stdout, stderr, 1024).join().await;
        assert_eq!(stats.stdout_frames, 1);
        assert_eq!(texts_for(&sink, "stdout"), vec!["before"]);
    }

    proptest! {
        #[test]
        fn test_within_stream_order_holds_for_any_timing(
            out_delays in prop::collection::vec(0u64..20, 1..6),
            err_delays in prop::collection::vec(0u64..20, 1..6),
        ) {
            let mut stdout = Builder::new();
            for (i, delay) in out_delays.iter().enumerate() {
                stdout.wait(Duration::from_millis(*delay)).read(format!("o{i};").as_bytes());
            }
            let mut stderr = Builder::new();
            for (i, delay) in err_delays.iter().enumerate() {
                stderr.wait(Duration::from_millis(*delay)).read(format!("e{i};").as_bytes());
            }
            let (stdout, stderr) = (stdout.build(), stderr.build());

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();
            let sink = RecordingSink::new();
            let emitter = SseEmitter::new(sink.clone());
            runtime.block_on(async {
                relay_output(&emitter, stdout, stderr, 1024).join().await;
            });

            let expected_out: Vec<String> = (0..out_delays.len()).map(|i| format!("o{i};")).collect();
            let expected_err: Vec<String> = (0..err_delays.len()).map(|i| format!("e{i};")).collect();
            prop_assert_eq!(texts_for(&sink, "stdout"), expected_out);
            prop_assert_eq!(texts_for(&sink, "stderr"), expected_err);
        }
    }
}
