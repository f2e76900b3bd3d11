use std::time::Duration;

/// Errors raised before any output has been streamed: the tool could not be
/// started, or the runner does not support the requested mode.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

/// Terminal error reported by an execution's wait future.
///
/// This is what the completion finalizer classifies once every output stream
/// has been drained.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("context deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("{message}")]
    Exit { code: i32, message: String },

    /// The run was cancelled, usually because its client went away.
    #[error("tool run cancelled")]
    Cancelled,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WaitError {
    /// Build an exit failure the way a process exit status renders itself.
    pub fn exit_code(code: i32) -> Self {
        WaitError::Exit {
            code,
            message: format!("exit status {code}"),
        }
    }

    /// Build an exit failure for a process terminated by a signal.
    pub fn signal(signal: i32) -> Self {
        WaitError::Exit {
            code: -1,
            message: format!("signal: {signal}"),
        }
    }
}
