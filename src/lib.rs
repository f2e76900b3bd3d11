//! # toolstream
//!
//! Relays a running tool's stdout, stderr and optional JSON event channel to
//! a client as one ordered server-sent-event stream.
//!
//! ## Usage
//!
//! ```bash
//! toolstream serve [--config toolstream.toml] [--listen 127.0.0.1:8765]
//! toolstream run [--events] [--timeout 30s] -- <program> [args..]
//! ```
//!
//! ## Modules
//!
//! - `streaming` - Framing, serialized emission, relaying, event reordering and finalization
//! - `subprocess` - Tool execution behind the `ToolRunner` trait, with a scripted mock
//! - `server` - axum HTTP endpoints serving sessions as SSE
//! - `app` - Configuration, logging and fatal error handling for the binary
//! - `testing` - In-memory sinks and SSE parsing helpers for tests
pub mod app;
pub mod error;
pub mod server;
pub mod streaming;
pub mod subprocess;

pub mod testing;

pub use error::{Error, Result};
