use super::*;
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[test]
fn test_builder_default_timeout_keeps_explicit_value() {
    let request = ToolRequestBuilder::new("sleep")
        .arg("1")
        .timeout(Duration::from_secs(5))
        .default_timeout(Some(Duration::from_secs(60)))
        .build();
    assert_eq!(request.timeout, Some(Duration::from_secs(5)));

    let request = ToolRequestBuilder::new("sleep")
        .default_timeout(Some(Duration::from_secs(60)))
        .build();
    assert_eq!(request.timeout, Some(Duration::from_secs(60)));
}

#[test]
fn test_builder_collects_args_and_env() {
    let request = ToolRequestBuilder::new("git")
        .args(["log", "--oneline"])
        .env("GIT_PAGER", "cat")
        .input("stdin".to_string())
        .build();

    assert_eq!(request.command_line(), "git log --oneline");
    assert_eq!(request.env.get("GIT_PAGER").map(String::as_str), Some("cat"));
    assert_eq!(request.input.as_deref(), Some("stdin"));
}

#[tokio::test]
async fn test_mock_runner_streams_scripted_output() {
    let mut mock = MockToolRunner::new();
    mock.expect_command("tool")
        .returns_stdout("hello")
        .returns_stderr("warning")
        .returns_exit_code(2)
        .finish();

    let mut execution = mock
        .stream(ToolRequestBuilder::new("tool").build())
        .await
        .unwrap();

    let mut stdout = String::new();
    execution.stdout.read_to_string(&mut stdout).await.unwrap();
    let mut stderr = String::new();
    execution.stderr.read_to_string(&mut stderr).await.unwrap();

    assert_eq!(stdout, "hello");
    assert_eq!(stderr, "warning");
    assert!(execution.events.is_none());
    assert!(matches!(
        execution.wait.await,
        Err(WaitError::Exit { code: 2, .. })
    ));
    assert!(mock.verify_called("tool", 1));
}

#[tokio::test]
async fn test_mock_runner_event_stream() {
    let mut mock = MockToolRunner::new();
    mock.expect_command("tool")
        .emits_event(json!({"runID": "a", "type": "callStart"}))
        .emits_event(json!({"runID": "a", "type": "callFinish"}))
        .finish();

    let execution = mock
        .stream_with_events(ToolRequestBuilder::new("tool").build())
        .await
        .unwrap();

    let mut events = String::new();
    execution
        .events
        .unwrap()
        .read_to_string(&mut events)
        .await
        .unwrap();
    assert_eq!(events.lines().count(), 2);
    assert!(execution.wait.await.is_ok());
}

#[tokio::test]
async fn test_mock_runner_unexpected_command() {
    let mock = MockToolRunner::new();
    let result = mock.stream(ToolRequestBuilder::new("other").build()).await;
    assert!(matches!(result, Err(ProcessError::MockExpectationNotMet(_))));
}

#[tokio::test]
async fn test_mock_runner_times_limit() {
    let mut mock = MockToolRunner::new();
    mock.expect_command("tool").times(1).finish();

    assert!(mock.run(ToolRequestBuilder::new("tool").build()).await.is_ok());
    assert!(mock.run(ToolRequestBuilder::new("tool").build()).await.is_err());
    assert_eq!(mock.get_call_history().len(), 2);
}

#[tokio::test]
async fn test_mock_runner_spawn_failure() {
    let mut mock = MockToolRunner::new();
    mock.expect_command("missing").fails_to_spawn().finish();

    let result = mock.stream(ToolRequestBuilder::new("missing").build()).await;
    assert!(matches!(result, Err(ProcessError::CommandNotFound(_))));
}
