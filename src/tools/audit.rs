//! Tool-call audit log
//!
//! Sinks observe every dispatched invocation after the fact. Recording never
//! fails or blocks the dispatcher: `FileAuditLog` hands entries to a
//! background writer task over an unbounded channel.
//!
//! Entry layout in the log file:
//!
//! ```text
//! Tool call: run_bash_shell
//! command: ls -la
//!
//!
//!
//! Output: total 0
//! --------------------------------------------------------------------------------
//! ```

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// One dispatched invocation and its normalized output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub tool: String,
    /// Arguments sorted by parameter name
    pub arguments: Vec<(String, String)>,
    pub output: String,
}

/// Observer of dispatched tool calls
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Render an entry in the log file layout
pub fn format_entry(entry: &AuditEntry) -> String {
    let mut text = format!("Tool call: {}\n", entry.tool);
    for (key, value) in &entry.arguments {
        text.push_str(&format!("{}: {}\n\n", key, value));
    }
    text.push_str("\n\n");
    text.push_str(&format!("Output: {}\n", entry.output));
    text.push_str(&"-".repeat(80));
    text.push_str("\n\n");
    text
}

/// Append-only audit file, truncated when created
pub struct FileAuditLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<String>,
}

/// Completion handle of the background writer
pub struct AuditFlush {
    handle: JoinHandle<()>,
}

impl FileAuditLog {
    /// Truncate `path` and start the writer task
    ///
    /// Drop the log and every `Arc` holding it, then await `AuditFlush::flush` to make
    /// sure all entries reached the disk.
    pub async fn create(path: impl AsRef<Path>) -> std::io::Result<(Self, AuditFlush)> {
        let path = path.as_ref().to_path_buf();
        let mut file = tokio::fs::File::create(&path).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_path = path.clone();
        let handle = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = file.write_all(text.as_bytes()).await {
                    warn!(path = %writer_path.display(), error = %e, "Failed to write audit entry");
                }
            }
            if let Err(e) = file.flush().await {
                warn!(path = %writer_path.display(), error = %e, "Failed to flush audit log");
            }
        });

        Ok((Self { path, tx }, AuditFlush { handle }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: &AuditEntry) {
        if self.tx.send(format_entry(entry)).is_err() {
            warn!(path = %self.path.display(), tool = %entry.tool, "Audit writer stopped, entry dropped");
        }
    }
}

impl AuditFlush {
    /// Wait until the writer has drained its queue
    pub async fn flush(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Audit writer task failed");
        }
    }
}
