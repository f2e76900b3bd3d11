use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::error::{ProcessError, WaitError};

/// Environment variable carrying the descriptor number of the event pipe
/// handed to a child started with [`ToolRunner::stream_with_events`].
pub const EVENTS_FD_ENV: &str = "TOOLSTREAM_EVENTS_FD";

/// A request to run one tool invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Written to the tool's stdin, which is then closed.
    #[serde(default)]
    pub input: Option<String>,
}

impl ToolRequest {
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;
pub type WaitFuture = Pin<Box<dyn Future<Output = Result<(), WaitError>> + Send>>;

/// The handles a running tool exposes to the streaming core: its output
/// streams, an optional structured event stream and a future that resolves
/// once the tool has finished.
///
/// `wait` must only be polled once every stream has been drained. Cancelling
/// `cancel` kills the tool and everything it started, which also closes the
/// streams.
pub struct Execution {
    pub stdout: ByteStream,
    pub stderr: ByteStream,
    pub events: Option<ByteStream>,
    pub wait: WaitFuture,
    pub cancel: CancellationToken,
}

impl Execution {
    pub fn new<O, E, W>(stdout: O, stderr: E, wait: W) -> Self
    where
        O: AsyncRead + Send + 'static,
        E: AsyncRead + Send + 'static,
        W: Future<Output = Result<(), WaitError>> + Send + 'static,
    {
        Self {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            events: None,
            wait: Box::pin(wait),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events<V>(mut self, events: V) -> Self
    where
        V: AsyncRead + Send + 'static,
    {
        self.events = Some(Box::pin(events));
        self
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion and capture the output.
    async fn run(&self, request: ToolRequest) -> Result<ToolOutput, ProcessError>;

    /// Start the tool and hand back its stdout and stderr as live streams.
    async fn stream(&self, request: ToolRequest) -> Result<Execution, ProcessError>;

    /// Like [`ToolRunner::stream`], plus a newline-delimited JSON event stream.
    async fn stream_with_events(&self, request: ToolRequest) -> Result<Execution, ProcessError>;
}

pub struct ProcessToolRunner;

impl ProcessToolRunner {
    /// Log command execution details
    fn log_command_start(request: &ToolRequest) {
        tracing::debug!("Executing tool: {}", request.command_line());

        if !request.env.is_empty() {
            tracing::trace!("Extra environment variables: {:?}", request.env.keys());
        }

        if let Some(ref dir) = request.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }

        if let Some(ref input) = request.input {
            tracing::trace!("Stdin provided: {} bytes", input.len());
        }
    }

    fn configure_command(request: &ToolRequest) -> Command {
        let mut cmd = Command::new(&request.program);

        // Own process group so a timeout can take down grandchildren too
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&request.args);
        cmd.envs(&request.env);

        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        if request.input.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Map spawn error to ProcessError
    fn map_spawn_error(error: std::io::Error, request: &ToolRequest) -> ProcessError {
        tracing::error!(
            "Failed to spawn '{}': {:?} (kind: {:?})",
            request.program,
            error,
            error.kind()
        );

        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::CommandNotFound(request.program.clone())
        } else {
            ProcessError::SpawnFailed {
                command: request.command_line(),
                source: error,
            }
        }
    }

    fn spawn(mut cmd: Command, request: &ToolRequest) -> Result<Child, ProcessError> {
        Self::log_command_start(request);
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, request))?;

        if let Some(input) = request.input.clone() {
            if let Some(stdin) = child.stdin.take() {
                tokio::spawn(Self::write_stdin(stdin, input));
            }
        }

        Ok(child)
    }

    /// Write stdin data to the child process, then close it. Runs beside the
    /// output readers so a large input cannot wedge against a full pipe.
    async fn write_stdin(mut stdin: tokio::process::ChildStdin, input: String) {
        use tokio::io::AsyncWriteExt;

        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            tracing::debug!("Tool closed stdin early: {}", e);
            return;
        }
        if let Err(e) = stdin.shutdown().await {
            tracing::debug!("Failed to close tool stdin: {}", e);
        }
    }

    /// Convert process exit status to our ExitStatus enum
    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => ExitStatus::Signal(signal),
            None => ExitStatus::Error(1),
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    fn check_status(status: std::process::ExitStatus) -> Result<(), WaitError> {
        match Self::parse_exit_status(status) {
            ExitStatus::Success => Ok(()),
            ExitStatus::Error(code) => Err(WaitError::exit_code(code)),
            ExitStatus::Signal(signal) => Err(WaitError::signal(signal)),
        }
    }

    /// Send SIGKILL to the process group led by `pid`. The group outlives
    /// its leader for as long as any member is alive.
    fn kill_group(pid: Option<u32>) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!("killpg({}) failed: {}", pid, e);
            }
        }

        #[cfg(not(unix))]
        let _ = pid;
    }

    /// Kill the whole process group, falling back to the child alone.
    async fn terminate(child: &mut Child) {
        Self::kill_group(child.id());

        if let Err(e) = child.kill().await {
            tracing::debug!("Failed to kill tool: {}", e);
        }
    }

    /// Resolves with the limit once it has elapsed; never without one.
    async fn deadline(timeout: Option<Duration>) -> Duration {
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    }

    /// Own the child until its output has been drained, enforcing the
    /// timeout and cancellation independently of whoever reads the output.
    ///
    /// The leader exiting is not the end: anything it left running in its
    /// group can still hold stdout or stderr open, so the deadline and the
    /// cancel token stay armed until `drained` fires.
    async fn supervise(
        mut child: Child,
        timeout: Option<Duration>,
        cancel: CancellationToken,
        drained: oneshot::Receiver<()>,
    ) -> Result<(), WaitError> {
        let pid = child.id();
        let deadline = Self::deadline(timeout);
        tokio::pin!(deadline);

        let status = tokio::select! {
            status = child.wait() => status?,
            limit = &mut deadline => {
                tracing::warn!("Tool timed out after {:?}, killing it", limit);
                Self::terminate(&mut child).await;
                return Err(WaitError::DeadlineExceeded(limit));
            }
            _ = cancel.cancelled() => {
                tracing::info!("Tool run cancelled, killing it");
                Self::terminate(&mut child).await;
                return Err(WaitError::Cancelled);
            }
        };

        tokio::select! {
            _ = drained => {}
            limit = &mut deadline => {
                tracing::warn!(
                    "Tool output still open {:?} after start, killing its process group",
                    limit
                );
                Self::kill_group(pid);
                return Err(WaitError::DeadlineExceeded(limit));
            }
            _ = cancel.cancelled() => {
                tracing::info!("Tool run cancelled, killing its process group");
                Self::kill_group(pid);
                return Err(WaitError::Cancelled);
            }
        }

        Self::check_status(status)
    }

    fn spawn_supervisor(
        child: Child,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> WaitFuture {
        let (drained_tx, drained_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(Self::supervise(child, timeout, cancel, drained_rx).await);
        });

        Box::pin(async move {
            // Polled only after the output streams reached end of file
            let _ = drained_tx.send(());
            rx.await.unwrap_or_else(|_| {
                Err(WaitError::Other(
                    "process supervisor exited without reporting".to_string(),
                ))
            })
        })
    }

    fn execution(
        mut child: Child,
        events: Option<ByteStream>,
        timeout: Option<Duration>,
    ) -> Result<Execution, ProcessError> {
        let (stdout, stderr) = Self::take_output(&mut child)?;
        let cancel = CancellationToken::new();

        Ok(Execution {
            stdout,
            stderr,
            events,
            wait: Self::spawn_supervisor(child, timeout, cancel.clone()),
            cancel,
        })
    }

    fn take_output(child: &mut Child) -> Result<(ByteStream, ByteStream), ProcessError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::Io(std::io::Error::other("Failed to capture stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::Io(std::io::Error::other("Failed to capture stderr")))?;
        Ok((Box::pin(stdout), Box::pin(stderr)))
    }

    /// Create a pipe whose write end survives exec in the child, advertising
    /// its descriptor number through [`EVENTS_FD_ENV`].
    #[cfg(unix)]
    fn attach_events_pipe(
        cmd: &mut Command,
    ) -> Result<(ByteStream, std::io::PipeWriter), ProcessError> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

        // Both ends start close-on-exec; only the child's copy of the writer
        // has the flag cleared, so sibling spawns never inherit it.
        let (reader, writer) = std::io::pipe()?;
        let raw = writer.as_raw_fd();
        cmd.env(EVENTS_FD_ENV, raw.to_string());

        // SAFETY: the closure only issues one fcntl(2) call, which is
        // async-signal-safe, and `raw` stays open in the parent until after
        // spawn returns.
        unsafe {
            cmd.pre_exec(move || {
                let fd = BorrowedFd::borrow_raw(raw);
                fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        Ok((Box::pin(receiver), writer))
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, request: ToolRequest) -> Result<ToolOutput, ProcessError> {
        let start = Instant::now();
        let cmd = Self::configure_command(&request);
        let child = Self::spawn(cmd, &request)?;
        let pid = child.id();

        let output = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    Self::kill_group(pid);
                    return Err(ProcessError::Timeout(limit));
                }
            },
            None => child.wait_with_output().await?,
        };

        let result = ToolOutput {
            status: Self::parse_exit_status(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        tracing::debug!(
            "Tool finished with {:?} in {:?}: {}",
            result.status,
            result.duration,
            request.command_line()
        );
        Ok(result)
    }

    async fn stream(&self, request: ToolRequest) -> Result<Execution, ProcessError> {
        let cmd = Self::configure_command(&request);
        let child = Self::spawn(cmd, &request)?;
        Self::execution(child, None, request.timeout)
    }

    #[cfg(unix)]
    async fn stream_with_events(&self, request: ToolRequest) -> Result<Execution, ProcessError> {
        let mut cmd = Self::configure_command(&request);
        let (events, writer) = Self::attach_events_pipe(&mut cmd)?;
        let spawned = Self::spawn(cmd, &request);
        // The parent's write end must go away, or the event stream never ends
        drop(writer);
        let child = spawned?;
        Self::execution(child, Some(events), request.timeout)
    }

    #[cfg(not(unix))]
    async fn stream_with_events(&self, _request: ToolRequest) -> Result<Execution, ProcessError> {
        Err(ProcessError::Unsupported(
            "event streams require a unix platform".to_string(),
        ))
    }
}
