//! Sandboxed remote execution
//!
//! # Architecture
//!
//! ```text
//! ToolDispatcher → run_bash_shell / run_python_code
//!                        ↓
//!                  SandboxChannel (TCP session, AUTH handshake)
//!                        ↓
//!                  SandboxServer (inside the sandbox)
//!                        ↓
//!                  /bin/sh -c … in its own process group, watchdog killpg
//!                        ↓
//!                  stdout / "Error: <stderr>" → back to the model
//! ```

pub mod channel;
pub mod protocol;
pub mod script;
pub mod server;

pub use channel::{ChannelState, SandboxChannel, SandboxConfig, SandboxError};
pub use protocol::ExecOutcome;
pub use script::ScriptRuntime;
pub use server::{HostConfig, SandboxServer};

/// A channel shared between tool handlers; the mutex serializes commands
pub type SharedSandbox = std::sync::Arc<tokio::sync::Mutex<SandboxChannel>>;

/// Wrap a channel for sharing between tool handlers
pub fn shared(channel: SandboxChannel) -> SharedSandbox {
    std::sync::Arc::new(tokio::sync::Mutex::new(channel))
}
