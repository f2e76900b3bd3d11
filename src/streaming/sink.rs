//! Destinations for SSE frames

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Where a session's frames end up.
///
/// Each call receives one complete frame; the emitter guarantees calls are
/// never concurrent.
#[async_trait]
pub trait EventSink: Send {
    async fn write(&mut self, frame: Bytes) -> io::Result<()>;

    /// Push buffered bytes to the client. Sinks without buffering keep the
    /// default.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink over any tokio writer, flushed after every frame.
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, frame: Bytes) -> io::Result<()> {
        self.writer.write_all(&frame).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

pub type BodyChunk = Result<Bytes, io::Error>;

/// Sink feeding a streaming HTTP body through a bounded channel.
pub struct ChannelSink {
    sender: mpsc::Sender<BodyChunk>,
}

impl ChannelSink {
    /// Create a sink and the receiving half that backs the response body.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BodyChunk>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Resolves once the receiving half is dropped, even if nothing is being
    /// written. The future keeps the channel open until it is dropped.
    pub fn disconnected(&self) -> impl Future<Output = ()> + Send + 'static {
        let sender = self.sender.clone();
        async move { sender.closed().await }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write(&mut self, frame: Bytes) -> io::Result<()> {
        self.sender
            .send(Ok(frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}
