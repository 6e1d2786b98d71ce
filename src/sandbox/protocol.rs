//! Wire protocol between the sandbox channel and the sandbox host
//!
//! A session starts with a one-line text handshake, then switches to
//! newline-delimited JSON frames:
//!
//! ```text
//! client                                   host
//!   │ AUTH <user> <password>\n ──────────────► │
//!   │ ◄────────────────────── OK <session-id>\n │   (or ERR <reason>\n)
//!   │ {"type":"exec","id":1,...}\n ───────────► │
//!   │ {"type":"kill","id":1}\n ───────────────► │   (optional, mid-execution)
//!   │ ◄──────────── {"type":"result","id":1,...}\n │   exactly one per exec
//!   │ {"type":"close"}\n ─────────────────────► │
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port used when no connection parameters are supplied
pub const DEFAULT_PORT: u16 = 2222;
/// Bootstrap username of the local disposable sandbox
pub const DEFAULT_USERNAME: &str = "python";
/// Bootstrap password of the local disposable sandbox
pub const DEFAULT_PASSWORD: &str = "python";
/// Working directory commands run in
pub const DEFAULT_WORKDIR: &str = "/mnt/tempfs";
/// Bound on establishing the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the AUTH/OK exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames sent by the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Exec {
        id: u64,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// Watchdog in milliseconds; 0 means the host's upper bound
        timeout_ms: u64,
    },
    Kill {
        id: u64,
    },
    Close,
}

/// Frames sent by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Result(ExecOutcome),
}

/// Outcome of one command execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub id: u64,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or never started
    pub exit_code: Option<i32>,
    pub duration_ms: f64,
    pub timed_out: bool,
    pub killed: bool,
}

impl ExecOutcome {
    /// Text handed to the model: stdout, or `Error: <stderr>` when stderr is non-empty
    pub fn into_tool_text(self) -> String {
        if self.stderr.is_empty() {
            self.stdout
        } else {
            format!("Error: {}", self.stderr)
        }
    }

    pub fn status_label(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.killed {
            "killed"
        } else if self.stderr.is_empty() {
            "success"
        } else {
            "error"
        }
    }
}

/// Serialize a frame as one JSON line
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one JSON line into a frame
pub fn decode_frame<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

/// `AUTH` line sent by the client
pub fn auth_line(username: &str, password: &str) -> String {
    format!("AUTH {} {}\n", username, password)
}

/// Split an `AUTH` line into username and password
pub fn parse_auth_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("AUTH"), Some(user), Some(password)) if !user.is_empty() => Some((user, password)),
        _ => None,
    }
}

/// Host reply to the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Ok { session_id: String },
    Err { reason: String },
}

impl HandshakeReply {
    pub fn to_line(&self) -> String {
        match self {
            HandshakeReply::Ok { session_id } => format!("OK {}\n", session_id),
            HandshakeReply::Err { reason } => format!("ERR {}\n", reason),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("OK ") {
            return Some(HandshakeReply::Ok {
                session_id: id.trim().to_string(),
            });
        }
        line.strip_prefix("ERR")
            .map(|reason| HandshakeReply::Err {
                reason: reason.trim().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_frame_wire_shape() {
        let frame = ClientFrame::Exec {
            id: 3,
            command: "echo hi".to_string(),
            cwd: None,
            timeout_ms: 3000,
        };
        let line = encode_frame(&frame).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""type":"exec""#));
        assert!(!line.contains("cwd"));
        assert_eq!(decode_frame::<ClientFrame>(&line).unwrap(), frame);
    }

    #[test]
    fn test_result_frame_is_tagged() {
        let frame = HostFrame::Result(ExecOutcome {
            id: 9,
            stdout: "hi\n".to_string(),
            ..Default::default()
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["id"], 9);
    }

    #[test]
    fn test_stderr_wins_over_stdout() {
        let outcome = ExecOutcome {
            stdout: "partial".to_string(),
            stderr: "boom".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(outcome.into_tool_text(), "Error: boom");
    }

    #[test]
    fn test_auth_line_roundtrip_keeps_spaces_in_password() {
        let line = auth_line("python", "pass word");
        assert_eq!(parse_auth_line(&line), Some(("python", "pass word")));
        assert_eq!(parse_auth_line("HELLO there"), None);
    }

    #[test]
    fn test_handshake_reply_parsing() {
        assert_eq!(
            HandshakeReply::parse("OK abc-123\n"),
            Some(HandshakeReply::Ok { session_id: "abc-123".to_string() })
        );
        assert_eq!(
            HandshakeReply::parse("ERR invalid credentials\n"),
            Some(HandshakeReply::Err { reason: "invalid credentials".to_string() })
        );
        assert_eq!(HandshakeReply::parse("HTTP/1.1 400"), None);
    }
}
