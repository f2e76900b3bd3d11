//! Completion finalizer: classify how the tool ended, report it, close the stream

use std::future::Future;
use tracing::{debug, info, warn};

use super::emitter::SseEmitter;
use crate::subprocess::WaitError;

/// How a tool run ended, derived once from its wait result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Timeout,
    ExitFailure { code: i32, message: String },
    WaitFailure { message: String },
    Success,
}

impl TerminalOutcome {
    pub fn classify(result: Result<(), WaitError>) -> Self {
        match result {
            Ok(()) => TerminalOutcome::Success,
            Err(WaitError::DeadlineExceeded(_)) => TerminalOutcome::Timeout,
            Err(WaitError::Exit { code, message }) => {
                TerminalOutcome::ExitFailure { code, message }
            }
            Err(other) => TerminalOutcome::WaitFailure {
                message: other.to_string(),
            },
        }
    }

    /// Text of the `err` event reported to the client, if any.
    pub fn diagnostic(&self, captured_stderr: &str) -> Option<String> {
        match self {
            TerminalOutcome::Timeout => {
                Some("The tool call took too long to complete, aborting".to_string())
            }
            TerminalOutcome::ExitFailure { code, message } => Some(format!(
                "The tool call returned an exit code of {} with message {:?} and output {:?}",
                code, message, captured_stderr
            )),
            TerminalOutcome::WaitFailure { message } => Some(format!(
                "failed to wait: {}, error output: {}",
                message, captured_stderr
            )),
            TerminalOutcome::Success => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalOutcome::Success)
    }
}

/// Wait for the tool, emit a `{time, err}` event when it failed, then write
/// the `[DONE]` sentinel. Must only run once every other writer on the
/// emitter has finished.
pub async fn finalize<W>(emitter: &SseEmitter, captured_stderr: &str, wait: W) -> TerminalOutcome
where
    W: Future<Output = Result<(), WaitError>>,
{
    let outcome = TerminalOutcome::classify(wait.await);

    match outcome.diagnostic(captured_stderr) {
        Some(message) => {
            warn!("Tool run failed: {}", message);
            emitter.emit_timestamped("err", message).await;
        }
        None => info!("Tool run completed"),
    }

    emitter.finish().await;
    debug!("Stream finalized with {:?}", outcome);
    outcome
}
