//! Streaming SSE responses backed by a session task

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, Instrument, Span};

use crate::streaming::{ChannelSink, SseEmitter, StreamSession, StreamingConfig};
use crate::subprocess::Execution;

/// Start a session for `execution` in the background and return the
/// response whose body carries its frames.
///
/// A client that disconnects cancels the tool; the session still drains
/// and reaps it.
pub fn sse_response(config: &StreamingConfig, execution: Execution) -> Response {
    let (sink, receiver) = ChannelSink::channel(config.channel_capacity);
    let disconnected = sink.disconnected();
    let session =
        StreamSession::new(SseEmitter::new(sink), config.clone()).cancel_when(disconnected);

    tokio::spawn(
        async move {
            let outcome = session.run(execution).await;
            debug!("Session ended: {:?}", outcome);
        }
        .instrument(Span::current()),
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(ReceiverStream::new(receiver)),
    )
        .into_response()
}
