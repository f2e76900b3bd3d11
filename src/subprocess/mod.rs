//! Execution collaborator: starts tools and exposes their output streams,
//! event channel and completion future to the streaming core.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

#[cfg(test)]
mod tests;

pub use builder::ToolRequestBuilder;
pub use error::{ProcessError, WaitError};
pub use mock::{MockCommandConfig, MockToolRunner};
pub use runner::{
    ByteStream, Execution, ExitStatus, ProcessToolRunner, ToolOutput, ToolRequest, ToolRunner,
    WaitFuture, EVENTS_FD_ENV,
};
