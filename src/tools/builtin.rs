//! Built-in sandbox tools
//!
//! - `run_bash_shell` - run a shell command in the sandbox
//! - `run_python_code` - run a python script in the sandbox (only printed output returns)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::registry::{
    RegistryError, ToolArguments, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolRegistry,
};
use super::search::WebSearchTool;
use crate::sandbox::{ScriptRuntime, SharedSandbox};

pub const SHELL_TOOL: &str = "run_bash_shell";
pub const PYTHON_TOOL: &str = "run_python_code";

/// Default watchdog for a single tool command
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs shell commands on the shared sandbox channel
pub struct ShellTool {
    sandbox: SharedSandbox,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(sandbox: SharedSandbox, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new(
            SHELL_TOOL,
            "Run a bash command in the remote server. Returns the stdout of the command, \
             or the error text if anything was written to stderr.",
        )
        .required("command", "Bash command to be executed in the remote server.")
    }
}

#[async_trait]
impl ToolHandler for ShellTool {
    async fn call(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = args.require("command")?;
        debug!(trace_id = %ctx.trace_id, command_len = command.len(), "Running shell command in sandbox");
        let mut channel = self.sandbox.lock().await;
        let outcome = channel
            .execute_with_cancel(command, self.timeout, &ctx.cancel)
            .await?;
        Ok(outcome.into_tool_text())
    }
}

/// Runs scripts through an interpreter on the shared sandbox channel
pub struct ScriptTool {
    sandbox: SharedSandbox,
    runtime: ScriptRuntime,
    timeout: Duration,
}

impl ScriptTool {
    pub fn new(sandbox: SharedSandbox, runtime: ScriptRuntime, timeout: Duration) -> Self {
        Self {
            sandbox,
            runtime,
            timeout,
        }
    }

    /// Descriptor of the python flavour
    pub fn python_descriptor() -> ToolDescriptor {
        ToolDescriptor::new(
            PYTHON_TOOL,
            "Run python code in the remote server. In order to see the output you MUST print it! \
             Only printed output is returned.",
        )
        .required("code", "Python code to be executed in the remote server.")
    }
}

#[async_trait]
impl ToolHandler for ScriptTool {
    async fn call(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<String, ToolError> {
        let code = args.require("code")?;
        debug!(
            trace_id = %ctx.trace_id,
            runtime = self.runtime.name(),
            code_len = code.len(),
            "Running script in sandbox"
        );
        let command = self.runtime.command_for(code);
        let mut channel = self.sandbox.lock().await;
        let outcome = channel
            .execute_with_cancel(&command, self.timeout, &ctx.cancel)
            .await?;
        Ok(outcome.into_tool_text())
    }
}

/// Registry with the sandbox tools, plus web search when given
///
/// # Arguments
/// * `sandbox` - Channel shared by both sandbox tools
/// * `timeout` - Watchdog for each sandbox command
/// * `search` - Optional web search tool
pub fn default_registry(
    sandbox: SharedSandbox,
    timeout: Duration,
    search: Option<WebSearchTool>,
) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(
        ShellTool::descriptor(),
        Arc::new(ShellTool::new(Arc::clone(&sandbox), timeout)),
    )?;
    registry.register(
        ScriptTool::python_descriptor(),
        Arc::new(ScriptTool::new(sandbox, ScriptRuntime::Python, timeout)),
    )?;
    if let Some(search) = search {
        registry.register(WebSearchTool::descriptor(), Arc::new(search))?;
    }
    Ok(registry)
}
