//! Tools the model can call
//!
//! - `registry` - descriptors, argument parsing, the `ToolHandler` seam
//! - `dispatcher` - runs tool calls and folds results into the conversation
//! - `audit` - post-dispatch observers and the audit log file
//! - `builtin` - sandbox shell and python tools
//! - `search` - optional web search

pub mod audit;
pub mod builtin;
pub mod dispatcher;
pub mod registry;
pub mod search;

pub use audit::{AuditEntry, AuditFlush, AuditSink, FileAuditLog};
pub use builtin::{default_registry, ScriptTool, ShellTool, DEFAULT_TOOL_TIMEOUT};
pub use dispatcher::{normalize_output, DispatchError, ToolDispatcher, ToolResult};
pub use registry::{
    ParamSpec, RegistryError, ToolArguments, ToolContext, ToolDescriptor, ToolError, ToolHandler,
    ToolRegistry,
};
pub use search::WebSearchTool;
