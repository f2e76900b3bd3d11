//! Chunk framer for raw output streams
//!
//! A frame is whatever a single read returned, minus one trailing `\r`.
//! Frames are not lines: boundaries follow the producer's write granularity
//! and the size of the read buffer.

use bytes::Bytes;
use futures::stream::{self, Stream};
use std::borrow::Cow;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// One unit of text output from a child stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame text; invalid UTF-8 is replaced with U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

/// Drop a single terminal `\r` from `data`.
pub fn drop_cr(data: &[u8]) -> &[u8] {
    match data.split_last() {
        Some((b'\r', rest)) => rest,
        _ => data,
    }
}

pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buf: vec![0; capacity.max(1)],
            done: false,
        }
    }

    /// Next non-empty frame. A read error is returned once, after which the
    /// reader reports end of stream.
    pub async fn next_frame(&mut self) -> Option<io::Result<Frame>> {
        while !self.done {
            match self.reader.read(&mut self.buf).await {
                Ok(0) => self.done = true,
                Ok(n) => {
                    let data = drop_cr(&self.buf[..n]);
                    if !data.is_empty() {
                        return Some(Ok(Frame(Bytes::copy_from_slice(data))));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = io::Result<Frame>> {
        stream::unfold(self, |mut reader| async move {
            reader.next_frame().await.map(|frame| (frame, reader))
        })
    }
}

/// Lazily frame `reader` with a read buffer of `capacity` bytes.
pub fn frames<R>(reader: R, capacity: usize) -> impl Stream<Item = io::Result<Frame>>
where
    R: AsyncRead + Unpin,
{
    FrameReader::new(reader, capacity).into_stream()
}
