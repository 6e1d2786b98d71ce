//! Tool dispatcher - resolves, invokes and folds tool calls back into a conversation
//!
//! ```text
//! assistant tool_calls ──► resolve all names (unknown → DispatchError, nothing appended)
//!                               │
//!                               ▼
//!                 parse args → handler.call() → normalize_output()
//!                               │
//!                               ▼
//!     the assistant message, then one `tool` message per call, in issuance order
//!                               │
//!                               ▼
//!                         audit sinks
//! ```
//!
//! The assistant message and its results land together or not at all, so a
//! failed dispatch never leaves tool calls without answers in the history.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use super::audit::{AuditEntry, AuditSink};
use super::registry::{RegistryError, ToolArguments, ToolContext, ToolError, ToolRegistry};
use crate::llm::{ChatMessage, Conversation, Tool, ToolCall};
use crate::metrics::TOOL_CALLS;

/// Longest tool output handed back to the model, in characters
pub const MAX_TOOL_OUTPUT_CHARS: usize = 1000;

/// Replaces an empty tool output
pub const EMPTY_OUTPUT_WARNING: &str =
    "Warning: There was no output from stdout. Did you forget to print?";

/// Appended to a truncated tool output
pub const TRUNCATION_NOTICE: &str =
    "\n\nWarning: Output was trimmed because it was too long (more than 1000 characters).";

/// Normalize raw tool output before it reaches the model
///
/// Empty output becomes `EMPTY_OUTPUT_WARNING`; output longer than
/// `MAX_TOOL_OUTPUT_CHARS` characters is cut and gets `TRUNCATION_NOTICE`.
pub fn normalize_output(raw: String) -> String {
    if raw.is_empty() {
        return EMPTY_OUTPUT_WARNING.to_string();
    }
    match raw.char_indices().nth(MAX_TOOL_OUTPUT_CHARS) {
        Some((cut, _)) => {
            warn!(chars = raw.chars().count(), "Tool output too long, trimming");
            let mut trimmed = raw[..cut].to_string();
            trimmed.push_str(TRUNCATION_NOTICE);
            trimmed
        }
        None => raw,
    }
}

/// Output of one dispatched call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: String,
}

/// Error type for dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("tool `{name}` failed: {source}")]
    Tool {
        name: String,
        #[source]
        source: ToolError,
    },
}

/// Dispatches model tool calls against a registry
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            sinks: Vec::new(),
        }
    }

    /// Report every dispatched call to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Function schemas of every registered tool
    pub fn tools(&self) -> Vec<Tool> {
        self.registry.tools()
    }

    /// Run every call of `request` and append it with one tool message per call
    ///
    /// # Arguments
    /// * `request` - Assistant message carrying the tool calls, in issuance order
    /// * `conversation` - History the request and its results are appended to
    /// * `ctx` - Trace id and cancellation token handed to every handler
    ///
    /// # Errors
    /// `Registry` when any call names an unregistered tool (checked before
    /// anything runs), `Tool` when a handler hits a fatal sandbox error. In
    /// both cases nothing is appended.
    pub async fn dispatch(
        &self,
        request: &ChatMessage,
        conversation: &mut Conversation,
        ctx: &ToolContext,
    ) -> Result<Vec<ToolResult>, DispatchError> {
        let calls = request.requested_tool_calls();
        let trace_id = ctx.trace_id.as_str();
        for call in calls {
            if !self.registry.contains(&call.function.name) {
                warn!(trace_id = %trace_id, tool = %call.function.name, "Model requested an unknown tool");
                TOOL_CALLS
                    .with_label_values(&["unknown", "rejected"])
                    .inc();
                return Err(RegistryError::UnknownTool(call.function.name.clone()).into());
            }
        }

        let mut results = Vec::with_capacity(calls.len());
        let mut entries = Vec::with_capacity(calls.len());

        for call in calls {
            let name = call.function.name.as_str();
            let span = info_span!(
                "tool_call",
                trace_id = %trace_id,
                tool = %name,
                call_id = %call.id,
                otel.name = "tool_call"
            );

            let (output, arguments) = self.invoke(call, ctx).instrument(span).await?;
            let output = normalize_output(output);

            entries.push(AuditEntry {
                tool: name.to_string(),
                arguments: arguments
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                output: output.clone(),
            });
            results.push(ToolResult {
                call_id: call.id.clone(),
                name: name.to_string(),
                output,
            });
        }

        conversation.push(request.clone());
        for result in &results {
            conversation.push(ChatMessage::tool(&result.call_id, &result.output));
        }
        for entry in &entries {
            for sink in &self.sinks {
                sink.record(entry);
            }
        }

        Ok(results)
    }

    /// Invoke one call; recoverable failures become `Error:` text
    async fn invoke(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<(String, ToolArguments), DispatchError> {
        let name = call.function.name.as_str();
        let (_, handler) = self.registry.resolve(name)?;
        let start = Instant::now();

        let args = match ToolArguments::parse(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %name, error = %e, "Malformed tool arguments");
                TOOL_CALLS.with_label_values(&[name, "invalid"]).inc();
                return Ok((format!("Error: {}", e), ToolArguments::default()));
            }
        };

        info!(tool = %name, "Invoking tool");
        let output = match handler.call(&args, ctx).await {
            Ok(output) => {
                TOOL_CALLS.with_label_values(&[name, "ok"]).inc();
                output
            }
            Err(e) if e.is_recoverable() => {
                warn!(tool = %name, error = %e, "Tool call failed");
                TOOL_CALLS.with_label_values(&[name, "error"]).inc();
                format!("Error: {}", e)
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call aborted");
                TOOL_CALLS.with_label_values(&[name, "fatal"]).inc();
                return Err(DispatchError::Tool {
                    name: name.to_string(),
                    source: e,
                });
            }
        };

        debug!(
            tool = %name,
            output_chars = output.chars().count(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Tool call finished"
        );
        Ok((output, args))
    }
}
