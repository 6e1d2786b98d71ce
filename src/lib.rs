//! sandsolve - tool-calling solve/verify agent with a sandboxed execution channel
//!
//! This library lets a chat-completion model solve a task by calling tools
//! (shell commands, script execution, web search) that run on an isolated
//! sandbox host, feeding the output back into the conversation until a
//! verifier turn declares the task solved.
//!
//! # Modules
//!
//! - `llm` - chat messages, the completion client and the usage ledger
//! - `sandbox` - the sandbox wire protocol, client channel and host server
//! - `tools` - tool registry, dispatcher, audit log and built-in tools
//! - `agent` - the orchestration loop and the solve/verify policy
//! - `config` - provider and sandbox configuration from the environment
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - tracing subscriber and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use sandsolve::{agent::Solver, sandbox::SandboxChannel};
//!
//! let sandbox = SandboxChannel::connect(&SandboxConfig::default()).await?;
//! let mut solver = Solver::new(controller, SolveConfig::default());
//! let outcome = solver.solve("9.11 and 9.9 -- which is bigger?").await?;
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod sandbox;
pub mod telemetry;
pub mod tools;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, AgentError, SolveConfig, SolveOutcome, SolvePolicy, Solver};
pub use llm::{ChatMessage, CompletionClient, Conversation, OpenAiClient, UsageLedger, UsageRecord};
pub use sandbox::{SandboxChannel, SandboxConfig, SandboxError, SandboxServer, ScriptRuntime};
pub use tools::{ToolDescriptor, ToolDispatcher, ToolRegistry};
