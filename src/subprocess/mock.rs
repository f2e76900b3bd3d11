use async_trait::async_trait;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::{ProcessError, WaitError};
use super::runner::{Execution, ExitStatus, ToolOutput, ToolRequest, ToolRunner};

/// Scripted [`ToolRunner`] for tests: each expectation replays fixed
/// stdout, stderr and event bytes, then resolves with a chosen outcome.
#[derive(Clone, Default)]
pub struct MockToolRunner {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<ToolRequest>>>,
}

#[derive(Clone)]
struct MockExpectation {
    program: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    events: Vec<u8>,
    outcome: MockOutcome,
    times_called: usize,
    expected_times: Option<usize>,
}

#[derive(Clone)]
enum MockOutcome {
    Success,
    ExitCode(i32),
    Timeout(Duration),
    WaitFailure(String),
    SpawnFailure,
}

pub struct MockCommandConfig {
    runner: MockToolRunner,
    expectation: MockExpectation,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_command(&mut self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: MockExpectation {
                program: program.to_string(),
                stdout: Vec::new(),
                stderr: Vec::new(),
                events: Vec::new(),
                outcome: MockOutcome::Success,
                times_called: 0,
                expected_times: None,
            },
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        let history = lock(&self.call_history);
        history.iter().filter(|req| req.program == program).count() == times
    }

    pub fn get_call_history(&self) -> Vec<ToolRequest> {
        lock(&self.call_history).clone()
    }

    fn take_expectation(&self, request: &ToolRequest) -> Result<MockExpectation, ProcessError> {
        lock(&self.call_history).push(request.clone());

        let mut expectations = lock(&self.expectations);
        let expectation = expectations
            .iter_mut()
            .find(|e| e.program == request.program)
            .ok_or_else(|| {
                ProcessError::MockExpectationNotMet(format!(
                    "No expectation found for command: {}",
                    request.command_line()
                ))
            })?;

        expectation.times_called += 1;
        if let Some(expected) = expectation.expected_times {
            if expectation.times_called > expected {
                return Err(ProcessError::MockExpectationNotMet(format!(
                    "Command '{}' called {} times, expected {}",
                    request.program, expectation.times_called, expected
                )));
            }
        }

        if let MockOutcome::SpawnFailure = expectation.outcome {
            return Err(ProcessError::CommandNotFound(request.program.clone()));
        }

        Ok(expectation.clone())
    }

    fn wait_result(outcome: &MockOutcome) -> Result<(), WaitError> {
        match outcome {
            MockOutcome::Success | MockOutcome::SpawnFailure => Ok(()),
            MockOutcome::ExitCode(code) => Err(WaitError::exit_code(*code)),
            MockOutcome::Timeout(after) => Err(WaitError::DeadlineExceeded(*after)),
            MockOutcome::WaitFailure(message) => Err(WaitError::Other(message.clone())),
        }
    }

    fn execution(expectation: MockExpectation) -> Execution {
        let result = Self::wait_result(&expectation.outcome);
        Execution::new(
            Cursor::new(expectation.stdout),
            Cursor::new(expectation.stderr),
            async move { result },
        )
    }
}

#[async_trait]
impl ToolRunner for MockToolRunner {
    async fn run(&self, request: ToolRequest) -> Result<ToolOutput, ProcessError> {
        let expectation = self.take_expectation(&request)?;
        let status = match &expectation.outcome {
            MockOutcome::Timeout(after) => return Err(ProcessError::Timeout(*after)),
            MockOutcome::ExitCode(code) => ExitStatus::Error(*code),
            MockOutcome::WaitFailure(message) => {
                return Err(ProcessError::Io(std::io::Error::other(message.clone())))
            }
            MockOutcome::Success | MockOutcome::SpawnFailure => ExitStatus::Success,
        };

        Ok(ToolOutput {
            status,
            stdout: String::from_utf8_lossy(&expectation.stdout).to_string(),
            stderr: String::from_utf8_lossy(&expectation.stderr).to_string(),
            duration: Duration::from_millis(10),
        })
    }

    async fn stream(&self, request: ToolRequest) -> Result<Execution, ProcessError> {
        let expectation = self.take_expectation(&request)?;
        Ok(Self::execution(expectation))
    }

    async fn stream_with_events(&self, request: ToolRequest) -> Result<Execution, ProcessError> {
        let expectation = self.take_expectation(&request)?;
        let events = expectation.events.clone();
        Ok(Self::execution(expectation).with_events(Cursor::new(events)))
    }
}

impl MockCommandConfig {
    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.stdout = stdout.as_bytes().to_vec();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.stderr = stderr.as_bytes().to_vec();
        self
    }

    /// Append one event line to the scripted event stream.
    pub fn emits_event(mut self, event: serde_json::Value) -> Self {
        self.expectation
            .events
            .extend_from_slice(event.to_string().as_bytes());
        self.expectation.events.push(b'\n');
        self
    }

    /// Append raw bytes to the event stream, for malformed input.
    pub fn emits_raw_events(mut self, raw: &str) -> Self {
        self.expectation.events.extend_from_slice(raw.as_bytes());
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.outcome = if code == 0 {
            MockOutcome::Success
        } else {
            MockOutcome::ExitCode(code)
        };
        self
    }

    pub fn times_out(mut self, after: Duration) -> Self {
        self.expectation.outcome = MockOutcome::Timeout(after);
        self
    }

    pub fn fails_wait(mut self, message: &str) -> Self {
        self.expectation.outcome = MockOutcome::WaitFailure(message.to_string());
        self
    }

    pub fn fails_to_spawn(mut self) -> Self {
        self.expectation.outcome = MockOutcome::SpawnFailure;
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.expectation.expected_times = Some(n);
        self
    }

    pub fn finish(self) {
        lock(&self.runner.expectations).push(self.expectation);
    }
}
