//! Integration tests for the sandbox channel against an in-process host
//!
//! Every test starts a `SandboxServer` on an ephemeral port with a temporary
//! working directory, so only `/bin/sh` and coreutils are needed. Tests that
//! need python3 are marked #[ignore].

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sandsolve::llm::{ChatMessage, Conversation, ToolCall};
use sandsolve::sandbox::server::CAPTURE_TRUNCATION_NOTICE;
use sandsolve::sandbox::{
    self, ChannelState, HostConfig, SandboxChannel, SandboxConfig, SandboxError, SandboxServer,
    ScriptRuntime,
};
use sandsolve::tools::{default_registry, ToolContext, ToolDispatcher};

const USER: &str = "tester";
const PASSWORD: &str = "s3cret";
const TIMEOUT: Duration = Duration::from_secs(5);

struct Host {
    config: SandboxConfig,
    workdir: TempDir,
}

async fn start_host() -> Host {
    start_host_with(HostConfig::default()).await
}

/// Start a host with `base`, overriding credentials and workdir
async fn start_host_with(base: HostConfig) -> Host {
    let workdir = tempfile::tempdir().unwrap();
    let server = SandboxServer::bind(
        "127.0.0.1:0",
        HostConfig {
            username: USER.to_string(),
            password: PASSWORD.to_string(),
            default_workdir: workdir.path().to_path_buf(),
            ..base
        },
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn();

    let config = SandboxConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: USER.to_string(),
        password: PASSWORD.to_string(),
        workdir: workdir.path().to_string_lossy().into_owned(),
        connect_timeout: Duration::from_secs(2),
    };
    Host { config, workdir }
}

async fn connect(host: &Host) -> SandboxChannel {
    SandboxChannel::connect(&host.config).await.unwrap()
}

#[tokio::test]
async fn test_echo_returns_stdout() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    assert_eq!(channel.state(), ChannelState::Connected);
    assert!(!channel.session_id().is_empty());
    assert_eq!(channel.run_shell("echo hi", TIMEOUT).await.unwrap(), "hi\n");
}

#[tokio::test]
async fn test_stderr_becomes_error_text() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let output = channel.run_shell("ls /nonexistent", TIMEOUT).await.unwrap();
    assert!(output.starts_with("Error: "), "got {output:?}");

    // stderr wins even when the command succeeds and printed to stdout
    let output = channel
        .run_shell("echo out; echo warn 1>&2; exit 0", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "Error: warn\n");
}

#[tokio::test]
async fn test_commands_run_in_session_workdir() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let expected = std::fs::canonicalize(host.workdir.path()).unwrap();
    let output = channel.run_shell("pwd", TIMEOUT).await.unwrap();
    assert_eq!(output.trim_end(), expected.to_string_lossy());

    channel.run_shell("echo data > note.txt", TIMEOUT).await.unwrap();
    assert!(host.workdir.path().join("note.txt").exists());
}

#[tokio::test]
async fn test_timeout_kills_and_drops_late_output() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let output = channel
        .run_shell("echo early; sleep 5; echo late", Duration::from_secs(1))
        .await
        .unwrap();

    assert!(output.starts_with("Error: "), "got {output:?}");
    assert!(output.contains("timed out"));
    assert!(!output.contains("late"));

    // The session stays usable
    assert_eq!(channel.run_shell("echo next", TIMEOUT).await.unwrap(), "next\n");
}

#[tokio::test]
async fn test_background_job_keeps_printed_output() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let start = std::time::Instant::now();
    let output = channel
        .run_shell("echo hi; sleep 4 &", Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(output, "hi\n");
    assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
}

#[tokio::test]
async fn test_oversized_output_is_capped_on_host() {
    let host = start_host_with(HostConfig {
        max_output_bytes: 64 * 1024,
        ..HostConfig::default()
    })
    .await;
    let mut channel = connect(&host).await;

    let outcome = channel
        .execute("head -c 5000000 /dev/zero | tr '\\0' x", TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout.len(), 64 * 1024 + CAPTURE_TRUNCATION_NOTICE.len());
    assert!(outcome.stdout.ends_with(CAPTURE_TRUNCATION_NOTICE));
}

#[tokio::test]
async fn test_zero_timeout_uses_host_cap() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let outcome = channel.execute("sleep 0.2; echo ok", Duration::ZERO).await.unwrap();
    assert_eq!(outcome.stdout, "ok\n");
    assert!(!outcome.timed_out);
}

#[tokio::test]
async fn test_script_through_shell_runtime() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let code = "name='it'\"'\"'s'\necho \"$name here\"";
    let output = channel
        .run_script(code, ScriptRuntime::Shell, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "it's here\n");
}

#[tokio::test]
#[ignore = "Requires python3 on the test machine"]
async fn test_python_script_prints_only() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    let output = channel
        .run_script("x = 21 * 2\nx\nprint(x)", ScriptRuntime::Python, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "42\n");
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let host = start_host().await;
    let config = SandboxConfig {
        password: "wrong".to_string(),
        ..host.config.clone()
    };

    let err = SandboxChannel::connect(&config).await.err().unwrap();
    assert!(matches!(err, SandboxError::AuthRejected(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unreachable_host() {
    // Grab a free port, then release it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = SandboxConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..SandboxConfig::default()
    };
    let err = SandboxChannel::connect(&config).await.err().unwrap();

    assert!(matches!(err, SandboxError::Unreachable { .. }), "got {err:?}");
    assert!(err.to_string().contains("sandbox host is running"));
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let host = start_host().await;
    let mut channel = connect(&host).await;

    channel.close().await.unwrap();

    assert_eq!(channel.state(), ChannelState::Closed);
    let err = channel.run_shell("echo hi", TIMEOUT).await.unwrap_err();
    assert!(matches!(err, SandboxError::Closed));
}

#[tokio::test]
async fn test_cancelled_command_leaves_no_leftover_output() {
    let host = start_host().await;
    let token = CancellationToken::new();
    let mut channel = connect(&host).await.with_cancellation(token.clone());

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        })
    };
    let err = channel
        .run_shell("sleep 3; echo stale", TIMEOUT)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, SandboxError::Cancelled));

    channel.set_cancellation(CancellationToken::new());
    let output = channel.run_shell("echo fresh", TIMEOUT).await.unwrap();
    assert_eq!(output, "fresh\n");
}

#[tokio::test]
async fn test_per_call_cancel_kills_the_command() {
    let host = start_host().await;
    let mut channel = connect(&host).await;
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        })
    };
    let start = std::time::Instant::now();
    let err = channel
        .execute_with_cancel("sleep 2; touch late.txt", TIMEOUT, &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, SandboxError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));

    // The channel token was never cancelled, so the session keeps working
    assert_eq!(channel.run_shell("echo fresh", TIMEOUT).await.unwrap(), "fresh\n");
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!host.workdir.path().join("late.txt").exists());
}

#[tokio::test]
async fn test_dispatcher_drives_sandbox_tools() {
    let host = start_host().await;
    let shared = sandbox::shared(connect(&host).await);
    let registry = default_registry(Arc::clone(&shared), TIMEOUT, None).unwrap();
    let dispatcher = ToolDispatcher::new(Arc::new(registry));
    let mut conv = Conversation::new();

    let request = ChatMessage::assistant_tool_calls(
        None,
        vec![
            ToolCall::new("c1", "run_bash_shell", r#"{"command": "echo hi"}"#),
            ToolCall::new("c2", "run_bash_shell", r#"{"command": "true"}"#),
            ToolCall::new("c3", "run_bash_shell", r#"{"command": "head -c 1500 /dev/zero | tr '\\0' x"}"#),
        ],
    );
    let ctx = ToolContext::new("trace", CancellationToken::new());
    let results = dispatcher.dispatch(&request, &mut conv, &ctx).await.unwrap();

    assert_eq!(results[0].output, "hi\n");
    assert_eq!(
        results[1].output,
        "Warning: There was no output from stdout. Did you forget to print?"
    );
    assert!(results[2].output.starts_with(&"x".repeat(1000)));
    assert!(results[2].output.ends_with("(more than 1000 characters)."));
    assert_eq!(conv.len(), 4);

    shared.lock().await.close().await.unwrap();
}
