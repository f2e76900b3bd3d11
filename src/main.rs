use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use toolstream::app::{handle_fatal_error, init_logging, AppConfig, ServerConfig};
use toolstream::server::ApiServer;
use toolstream::streaming::{SseEmitter, StreamSession, StreamingConfig, WriterSink};
use toolstream::subprocess::{ProcessToolRunner, ToolRequestBuilder, ToolRunner};

/// Relay a tool's output and events as an ordered server-sent-event stream
#[derive(Parser)]
#[command(name = "toolstream")]
#[command(about = "Stream tool output as server-sent events", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Path to configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding the config file
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Run one tool and write its SSE stream to stdout
    Run {
        /// Also stream the tool's event channel
        #[arg(long)]
        events: bool,

        /// Kill the tool after this long (e.g. "30s", "2m")
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Program and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = AppConfig::new(cli.verbose);
    init_logging(&config);

    let result = match cli.command {
        Commands::Serve { config, listen } => run_serve(config, listen).await,
        Commands::Run {
            events,
            timeout,
            command,
        } => run_tool(events, timeout, command).await,
    };

    if let Err(e) = result {
        handle_fatal_error(e, cli.verbose);
    }
}

async fn run_serve(config_path: Option<PathBuf>, listen: Option<SocketAddr>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => ServerConfig::load(&path).map_err(toolstream::Error::from)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = listen {
        config = config.with_listen(listen);
    }

    ApiServer::new(Arc::new(ProcessToolRunner), config)
        .start()
        .await
        .context("API server failed")
}

async fn run_tool(events: bool, timeout: Option<Duration>, command: Vec<String>) -> Result<()> {
    let (program, args) = command
        .split_first()
        .context("missing program to run")?;

    let mut builder = ToolRequestBuilder::new(program).args(args);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let request = builder.build();

    let runner = ProcessToolRunner;
    let execution = if events {
        runner.stream_with_events(request).await
    } else {
        runner.stream(request).await
    }
    .map_err(toolstream::Error::from)?;

    let emitter = SseEmitter::new(WriterSink::new(tokio::io::stdout()));
    let outcome = StreamSession::new(emitter, StreamingConfig::default())
        .run(execution)
        .await;

    info!("Tool run finished: {:?}", outcome);
    if outcome.is_success() {
        Ok(())
    } else {
        anyhow::bail!("tool run failed: {:?}", outcome)
    }
}
