//! Host-side channel to a sandbox execution host
//!
//! The `SandboxChannel` owns one persistent TCP session with the sandbox host.
//! Every command runs under a watchdog on the host; this side only adds a
//! grace margin so a wedged host can never hang the agent.
//!
//! ```text
//! connect() ──► Connected ──► close() ──► Closed
//!                  │  ▲
//!        run_shell │  │ result frame
//!                  ▼  │
//!              host watchdog (killpg on timeout / kill frame)
//! ```
//!
//! A channel runs one command at a time. Share it behind an async mutex.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    auth_line, decode_frame, encode_frame, ClientFrame, ExecOutcome, HandshakeReply, HostFrame,
    CONNECT_TIMEOUT, DEFAULT_PASSWORD, DEFAULT_PORT, DEFAULT_USERNAME, DEFAULT_WORKDIR,
    HANDSHAKE_TIMEOUT,
};
use super::script::ScriptRuntime;
use crate::metrics::SANDBOX_EXEC_DURATION;

/// Extra time granted to the host beyond the command timeout
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Longest host frame accepted; the host caps each captured stream well below this
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Connection parameters for a sandbox host
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Working directory every command runs in
    pub workdir: String,
    pub connect_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl SandboxConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Error type for sandbox channel operations
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox unreachable at {addr}: {reason}. Check that the sandbox host is running")]
    Unreachable { addr: String, reason: String },

    #[error("sandbox handshake failed: {0}")]
    Handshake(String),

    #[error("sandbox rejected credentials: {0}")]
    AuthRejected(String),

    #[error("sandbox channel closed")]
    Closed,

    #[error("sandbox command cancelled")]
    Cancelled,

    #[error("sandbox connection lost")]
    ConnectionLost,

    #[error("sandbox host did not answer within {0:?}")]
    Unresponsive(Duration),

    #[error("sandbox frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Closed,
}

/// Persistent session with a sandbox host
pub struct SandboxChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a partially received line, kept across cancelled reads
    line_buf: Vec<u8>,
    session_id: String,
    workdir: String,
    next_id: u64,
    state: ChannelState,
    cancel: CancellationToken,
}

impl SandboxChannel {
    /// Connect and authenticate to a sandbox host
    ///
    /// # Arguments
    /// * `config` - Host, port, credentials and working directory
    ///
    /// # Errors
    /// `Unreachable` when no TCP connection is established within
    /// `config.connect_timeout`, `AuthRejected` on bad credentials.
    pub async fn connect(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let addr = config.address();

        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SandboxError::Unreachable {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SandboxError::Unreachable {
                    addr,
                    reason: format!("no connection after {:?}", config.connect_timeout),
                })
            }
        };
        stream.set_nodelay(true)?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let handshake = async {
            writer
                .write_all(auth_line(&config.username, &config.password).as_bytes())
                .await?;
            let mut reply = String::new();
            let n = reader.read_line(&mut reply).await?;
            if n == 0 {
                return Err(SandboxError::Handshake("host closed the connection".to_string()));
            }
            Ok::<_, SandboxError>(reply)
        };

        let reply = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(SandboxError::Handshake(
                    "timeout waiting for handshake response".to_string(),
                ))
            }
        };

        let session_id = match HandshakeReply::parse(&reply) {
            Some(HandshakeReply::Ok { session_id }) => session_id,
            Some(HandshakeReply::Err { reason }) => return Err(SandboxError::AuthRejected(reason)),
            None => {
                return Err(SandboxError::Handshake(format!(
                    "unexpected handshake response: '{}' (expected 'OK <session>')",
                    reply.trim()
                )))
            }
        };

        info!(addr = %addr, session_id = %session_id, workdir = %config.workdir, "Sandbox session opened");

        Ok(Self {
            reader,
            writer,
            line_buf: Vec::new(),
            session_id,
            workdir: config.workdir.clone(),
            next_id: 1,
            state: ChannelState::Connected,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort pending commands when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the cancellation token, e.g. after a cancelled command
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Run a shell command in the session working directory
    ///
    /// Returns stdout, or `Error: <stderr>` when anything was written to
    /// stderr (including a watchdog timeout).
    pub async fn run_shell(&mut self, command: &str, timeout: Duration) -> Result<String, SandboxError> {
        let outcome = self.execute(command, timeout).await?;
        Ok(outcome.into_tool_text())
    }

    /// Run source code through an interpreter
    ///
    /// Only output the script explicitly prints is captured.
    pub async fn run_script(
        &mut self,
        code: &str,
        runtime: ScriptRuntime,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        let command = runtime.command_for(code);
        self.run_shell(&command, timeout).await
    }

    /// Execute a command and return the raw outcome
    ///
    /// `Duration::ZERO` asks the host for its own upper bound.
    pub async fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutcome, SandboxError> {
        let never = CancellationToken::new();
        self.execute_with_cancel(command, timeout, &never).await
    }

    /// Execute a command that is also killed when `cancel` fires
    ///
    /// The channel's own token still applies. On cancellation a `kill` frame
    /// is sent before returning `Cancelled`.
    pub async fn execute_with_cancel(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, SandboxError> {
        if self.state == ChannelState::Closed {
            return Err(SandboxError::Closed);
        }
        if self.cancel.is_cancelled() || cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let id = self.next_id;
        self.next_id += 1;
        let start = Instant::now();

        let frame = ClientFrame::Exec {
            id,
            command: command.to_string(),
            cwd: Some(self.workdir.clone()),
            timeout_ms: timeout_millis(timeout),
        };
        self.send(&frame).await?;
        debug!(session_id = %self.session_id, id, timeout_ms = timeout_millis(timeout), "Command sent");

        let own_cancel = self.cancel.clone();
        let wait_limit = timeout + RESPONSE_GRACE;

        let result = tokio::select! {
            biased;
            _ = own_cancel.cancelled() => Err(SandboxError::Cancelled),
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            r = tokio::time::timeout(wait_limit, Self::read_result(&mut self.reader, &mut self.line_buf, id)) => {
                match r {
                    Ok(r) => r,
                    Err(_) => Err(SandboxError::Unresponsive(wait_limit)),
                }
            }
        };

        match result {
            Ok(outcome) => {
                SANDBOX_EXEC_DURATION
                    .with_label_values(&[outcome.status_label()])
                    .observe(start.elapsed().as_secs_f64());
                debug!(
                    session_id = %self.session_id,
                    id,
                    exit_code = ?outcome.exit_code,
                    timed_out = outcome.timed_out,
                    duration_ms = outcome.duration_ms,
                    "Command finished"
                );
                Ok(outcome)
            }
            Err(e @ (SandboxError::Cancelled | SandboxError::Unresponsive(_))) => {
                // The late result for `id` is discarded by the next read.
                warn!(session_id = %self.session_id, id, error = %e, "Killing sandbox command");
                if let Err(kill_err) = self.send(&ClientFrame::Kill { id }).await {
                    warn!(error = %kill_err, "Failed to send kill frame");
                }
                SANDBOX_EXEC_DURATION
                    .with_label_values(&["aborted"])
                    .observe(start.elapsed().as_secs_f64());
                Err(e)
            }
            Err(e) => {
                self.state = ChannelState::Closed;
                Err(e)
            }
        }
    }

    /// Release the connection; later operations fail with `Closed`
    pub async fn close(&mut self) -> Result<(), SandboxError> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        self.state = ChannelState::Closed;
        let _ = self.send(&ClientFrame::Close).await;
        self.writer.shutdown().await?;
        info!(session_id = %self.session_id, "Sandbox session closed");
        Ok(())
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<(), SandboxError> {
        let line = encode_frame(frame)?;
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read frames until the result for `id` arrives, skipping stale results
    async fn read_result(
        reader: &mut BufReader<OwnedReadHalf>,
        line_buf: &mut Vec<u8>,
        id: u64,
    ) -> Result<ExecOutcome, SandboxError> {
        loop {
            // read_until keeps partial bytes in `line_buf` if this future is dropped
            let budget = MAX_FRAME_BYTES.saturating_sub(line_buf.len()) as u64;
            let n = (&mut *reader).take(budget).read_until(b'\n', line_buf).await?;
            if n == 0 && line_buf.is_empty() {
                return Err(SandboxError::ConnectionLost);
            }
            if line_buf.last() != Some(&b'\n') {
                if line_buf.len() >= MAX_FRAME_BYTES {
                    line_buf.clear();
                    return Err(SandboxError::FrameTooLarge(MAX_FRAME_BYTES));
                }
                return Err(SandboxError::ConnectionLost);
            }

            let line = String::from_utf8_lossy(line_buf).into_owned();
            line_buf.clear();

            let HostFrame::Result(outcome) = decode_frame::<HostFrame>(&line)?;
            if outcome.id == id {
                return Ok(outcome);
            }
            debug!(stale_id = outcome.id, expected = id, "Discarding stale sandbox result");
        }
    }
}

/// Wire timeout; zero stays zero, anything shorter than a millisecond rounds up
fn timeout_millis(timeout: Duration) -> u64 {
    if timeout.is_zero() {
        0
    } else {
        (timeout.as_millis() as u64).max(1)
    }
}
