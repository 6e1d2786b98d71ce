//! Sandbox host - executes commands on behalf of remote channels
//!
//! Runs inside the isolated sandbox (container or VM). Each accepted
//! connection authenticates with the pre-shared credentials, then has its
//! commands executed one at a time:
//!
//! 1. `/bin/sh -c <command>` is spawned in its own process group
//! 2. stdout/stderr are captured up to `HostConfig::max_output_bytes` each
//! 3. the watchdog kills the whole process group on timeout or on a `kill` frame
//! 4. once the shell is gone, leftover background members of the group are killed
//! 5. exactly one `result` frame is written back per `exec`

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{
    decode_frame, encode_frame, parse_auth_line, ClientFrame, ExecOutcome, HandshakeReply,
    HostFrame, DEFAULT_PASSWORD, DEFAULT_USERNAME, DEFAULT_WORKDIR, HANDSHAKE_TIMEOUT,
};
use crate::metrics::SANDBOX_HOST_EXECUTIONS;

/// How long to wait for pipes to drain after the process group is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Per-stream capture limit unless configured otherwise
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;
/// Appended to a stream cut at the capture limit
pub const CAPTURE_TRUNCATION_NOTICE: &str = "\n[output truncated by the sandbox host]\n";

/// Settings of the sandbox host
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub username: String,
    pub password: String,
    /// Used when an `exec` frame carries no `cwd`
    pub default_workdir: PathBuf,
    /// Upper bound on any requested timeout; also used for `timeout_ms: 0`
    pub max_timeout: Duration,
    /// Bytes kept from each of stdout and stderr; the rest is read and dropped
    pub max_output_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            default_workdir: PathBuf::from(DEFAULT_WORKDIR),
            max_timeout: Duration::from_secs(600),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// TCP server executing sandbox commands
pub struct SandboxServer {
    listener: TcpListener,
    config: Arc<HostConfig>,
}

impl SandboxServer {
    pub async fn bind(addr: impl ToSocketAddrs, config: HostConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per session
    pub async fn serve(self) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, workdir = %self.config.default_workdir.display(), "Sandbox host ready");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    continue;
                }
            };
            let config = Arc::clone(&self.config);
            let span = info_span!("sandbox_session", peer = %peer);
            tokio::spawn(
                async move {
                    if let Err(e) = handle_connection(stream, config).await {
                        warn!(error = %e, "Session ended with error");
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Run `serve` on a background task
    pub fn spawn(self) -> JoinHandle<std::io::Result<()>> {
        tokio::spawn(self.serve())
    }
}

async fn handle_connection(stream: TcpStream, config: Arc<HostConfig>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Handshake
    let mut line = String::new();
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {}
        Ok(Ok(_)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!("Handshake timed out");
            return Ok(());
        }
    }

    let authorized = matches!(
        parse_auth_line(&line),
        Some((user, password)) if user == config.username && password == config.password
    );
    if !authorized {
        warn!("Rejected session with invalid credentials");
        let reply = HandshakeReply::Err {
            reason: "invalid credentials".to_string(),
        };
        writer.write_all(reply.to_line().as_bytes()).await?;
        return Ok(());
    }

    let session_id = uuid::Uuid::now_v7().to_string();
    writer
        .write_all(HandshakeReply::Ok { session_id: session_id.clone() }.to_line().as_bytes())
        .await?;
    info!(session_id = %session_id, "Session authenticated");

    // Frames are read on their own task so a `kill` can arrive mid-execution
    let (tx, mut rx) = mpsc::channel::<ClientFrame>(32);
    let frame_reader = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => match decode_frame::<ClientFrame>(&line) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed frame"),
                },
                Err(e) => {
                    debug!(error = %e, "Frame reader stopped");
                    break;
                }
            }
        }
    });

    let mut pending: VecDeque<ClientFrame> = VecDeque::new();
    loop {
        let frame = match pending.pop_front() {
            Some(frame) => frame,
            None => match rx.recv().await {
                Some(frame) => frame,
                None => break,
            },
        };

        match frame {
            ClientFrame::Close => break,
            ClientFrame::Kill { id } => debug!(id, "Kill for a command that is not running"),
            ClientFrame::Exec {
                id,
                command,
                cwd,
                timeout_ms,
            } => {
                let timeout = effective_timeout(timeout_ms, config.max_timeout);
                let workdir = cwd
                    .map(PathBuf::from)
                    .unwrap_or_else(|| config.default_workdir.clone());

                let limits = RunLimits {
                    timeout,
                    max_output_bytes: config.max_output_bytes,
                };
                let outcome = run_command(id, &command, &workdir, limits, &mut rx, &mut pending).await;
                SANDBOX_HOST_EXECUTIONS
                    .with_label_values(&[outcome.status_label()])
                    .inc();

                let line = encode_frame(&HostFrame::Result(outcome))
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writer.write_all(line.as_bytes()).await?;
            }
        }
    }

    frame_reader.abort();
    info!(session_id = %session_id, "Session closed");
    Ok(())
}

/// Requested timeout bounded by the host cap; zero means the cap itself
fn effective_timeout(timeout_ms: u64, max_timeout: Duration) -> Duration {
    if timeout_ms == 0 {
        max_timeout
    } else {
        Duration::from_millis(timeout_ms).min(max_timeout)
    }
}

/// Bounds applied to one command
#[derive(Debug, Clone, Copy)]
struct RunLimits {
    timeout: Duration,
    max_output_bytes: usize,
}

/// How a watched command ended
enum Termination {
    Exited(Option<i32>),
    TimedOut,
    Killed,
}

/// Execute one command under the watchdog
///
/// Frames other than a matching `kill` that arrive meanwhile are queued in
/// `pending`; a `close` or a dropped connection kills the command.
async fn run_command(
    id: u64,
    command: &str,
    workdir: &Path,
    limits: RunLimits,
    rx: &mut mpsc::Receiver<ClientFrame>,
    pending: &mut VecDeque<ClientFrame>,
) -> ExecOutcome {
    let RunLimits {
        timeout,
        max_output_bytes,
    } = limits;
    let start = Instant::now();
    let failed = |stderr: String| ExecOutcome {
        id,
        stderr,
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        ..Default::default()
    };

    if !tokio::fs::metadata(workdir).await.map(|m| m.is_dir()).unwrap_or(false) {
        return failed(format!("working directory {} does not exist\n", workdir.display()));
    }

    debug!(id, code_len = command.len(), timeout_ms = timeout.as_millis() as u64, "Executing command");

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return failed(format!("failed to start command: {}\n", e)),
    };
    let pgid = child.id();

    let stdout_capture = child.stdout.take().map(|pipe| Capture::spawn(pipe, max_output_bytes));
    let stderr_capture = child.stderr.take().map(|pipe| Capture::spawn(pipe, max_output_bytes));

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let termination = loop {
        tokio::select! {
            status = child.wait() => {
                break Termination::Exited(status.ok().and_then(|s| s.code()));
            }
            _ = &mut deadline => {
                kill_group(pgid);
                break Termination::TimedOut;
            }
            frame = rx.recv() => match frame {
                Some(ClientFrame::Kill { id: target }) if target == id => {
                    kill_group(pgid);
                    break Termination::Killed;
                }
                Some(ClientFrame::Kill { id: stale }) => debug!(stale, "Ignoring kill for another command"),
                Some(ClientFrame::Close) | None => {
                    kill_group(pgid);
                    pending.push_back(ClientFrame::Close);
                    break Termination::Killed;
                }
                Some(frame) => pending.push_back(frame),
            }
        }
    };

    match termination {
        // background jobs of the shell still hold the pipes
        Termination::Exited(_) => kill_group(pgid),
        // reap; the group is already gone
        _ => {
            let _ = child.wait().await;
        }
    }

    let stdout = Capture::drain(stdout_capture).await;
    let mut stderr = Capture::drain(stderr_capture).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (exit_code, timed_out, killed) = match termination {
        Termination::Exited(code) => (code, false, false),
        Termination::TimedOut => {
            warn!(id, timeout_ms = timeout.as_millis() as u64, "Command timed out, process group killed");
            stderr.push_str(&format!(
                "Command timed out after {:.1}s and was killed\n",
                timeout.as_secs_f64()
            ));
            (None, true, false)
        }
        Termination::Killed => {
            info!(id, "Command killed on request");
            (None, false, true)
        }
    };

    ExecOutcome {
        id,
        stdout,
        stderr,
        exit_code,
        duration_ms,
        timed_out,
        killed,
    }
}

/// Output of one pipe, bounded, readable even while the reader is still running
#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Capture {
    /// Read `pipe` to EOF in the background, keeping at most `limit` bytes
    fn spawn<R>(mut pipe: R, limit: usize) -> (Arc<Mutex<Capture>>, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let sink = Arc::clone(&capture);
        let task = tokio::spawn(async move {
            let mut chunk = vec![0u8; 8192];
            loop {
                let n = match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut capture = sink.lock().await;
                let room = limit.saturating_sub(capture.bytes.len());
                if n > room {
                    capture.bytes.extend_from_slice(&chunk[..room]);
                    capture.truncated = true;
                } else {
                    capture.bytes.extend_from_slice(&chunk[..n]);
                }
            }
        });
        (capture, task)
    }

    /// Collect what was captured, giving up on the reader after `DRAIN_TIMEOUT`
    ///
    /// Bytes read before the timeout are kept.
    async fn drain(capture: Option<(Arc<Mutex<Capture>>, JoinHandle<()>)>) -> String {
        let Some((capture, mut task)) = capture else {
            return String::new();
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Output capture task failed"),
            Err(_) => {
                debug!("Pipe still open after drain timeout, keeping partial output");
                task.abort();
            }
        }

        let capture = capture.lock().await;
        let mut text = String::from_utf8_lossy(&capture.bytes).into_owned();
        if capture.truncated {
            text.push_str(CAPTURE_TRUNCATION_NOTICE);
        }
        text
    }
}

fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!(pgid, error = %e, "killpg failed (group already gone?)");
    }
}
