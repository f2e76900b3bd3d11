//! One streaming session: drive a tool's streams onto a single emitter and
//! close with the sentinel once everything has drained.

use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::emitter::SseEmitter;
use super::finalize::{finalize, TerminalOutcome};
use super::relay::relay_output;
use super::reorder::stream_events;
use super::types::{StreamSource, StreamingConfig};
use crate::subprocess::{Execution, WaitFuture};

type DisconnectSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct StreamSession {
    emitter: SseEmitter,
    config: StreamingConfig,
    span: Span,
    disconnect: Option<DisconnectSignal>,
}

impl StreamSession {
    pub fn new(emitter: SseEmitter, config: StreamingConfig) -> Self {
        let span = info_span!("stream_session", session_id = %Uuid::new_v4());
        Self {
            emitter,
            config,
            span,
            disconnect: None,
        }
    }

    /// Cancel the tool when `signal` resolves before the session ends.
    pub fn cancel_when<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.disconnect = Some(Box::pin(signal));
        self
    }

    /// Stream everything `execution` produces and finish the stream. The
    /// tool is cancelled as soon as the client is known to be gone.
    pub async fn run(mut self, execution: Execution) -> TerminalOutcome {
        let Execution {
            stdout,
            stderr,
            events,
            wait,
            cancel,
        } = execution;

        self.emitter.cancel_on_close(cancel.clone()).await;
        let watcher = self.disconnect.take().map(|signal| {
            tokio::spawn(
                async move {
                    signal.await;
                    info!("Client disconnected, cancelling tool");
                    cancel.cancel();
                }
                .instrument(self.span.clone()),
            )
        });

        let outcome = match events {
            Some(events) => self.run_events(stdout, stderr, events, wait).await,
            None => self.run_output(stdout, stderr, wait).await,
        };

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        outcome
    }

    /// Relay stdout and stderr as they arrive, then finalize.
    pub async fn run_output<O, E>(self, stdout: O, stderr: E, wait: WaitFuture) -> TerminalOutcome
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let span = self.span.clone();
        async move {
            debug!("Streaming tool output");
            let relay = relay_output(&self.emitter, stdout, stderr, self.config.read_buffer_size);
            let stats = relay.join().await;
            debug!(
                "Output drained: {} stdout frames, {} stderr frames",
                stats.stdout_frames, stats.stderr_frames
            );

            finalize(&self.emitter, "", wait).await
        }
        .instrument(span)
        .await
    }

    /// Stream the event channel through the reorderer while stdout and stderr
    /// are collected, then report both outputs and finalize.
    pub async fn run_events<O, E, V>(
        self,
        stdout: O,
        stderr: E,
        events: V,
        wait: WaitFuture,
    ) -> TerminalOutcome
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
        V: AsyncRead + Unpin,
    {
        let span = self.span.clone();
        async move {
            let stdout_task = collect_output(stdout, StreamSource::Stdout);
            let stderr_task = collect_output(stderr, StreamSource::Stderr);

            let emitted =
                stream_events(&self.emitter, events, self.config.reorder.clone()).await;
            debug!("Event stream closed after {} events", emitted);

            let stdout = join_output(stdout_task, StreamSource::Stdout).await;
            let stderr = join_output(stderr_task, StreamSource::Stderr).await;

            self.emitter
                .emit_timestamped(StreamSource::Stderr.key(), stderr.clone())
                .await;
            self.emitter
                .emit_timestamped(StreamSource::Stdout.key(), stdout)
                .await;

            finalize(&self.emitter, &stderr, wait).await
        }
        .instrument(span)
        .await
    }
}

/// Read a stream to the end in the background. A read error keeps what was
/// read so far.
fn collect_output<R>(mut reader: R, source: StreamSource) -> JoinHandle<String>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(
        async move {
            let mut buf = Vec::new();
            if let Err(e) = reader.read_to_end(&mut buf).await {
                warn!("Failed to read {}: {}", source.key(), e);
            }
            String::from_utf8_lossy(&buf).into_owned()
        }
        .instrument(Span::current()),
    )
}

async fn join_output(task: JoinHandle<String>, source: StreamSource) -> String {
    match task.await {
        Ok(output) => output,
        Err(e) => {
            error!("Collecting {} failed: {}", source.key(), e);
            String::new()
        }
    }
}
