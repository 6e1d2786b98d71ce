//! Tool registry - statically declared descriptors and their handlers
//!
//! Every tool declares its name, purpose and parameters up front in a
//! `ToolDescriptor`. The registry keeps descriptors in registration order and
//! renders them as function schemas for the model.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{Tool, ToolFunction};
use crate::sandbox::SandboxError;

/// One declared tool parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub description: String,
}

/// Name, purpose and parameters of a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub purpose: String,
    pub params: Vec<ParamSpec>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.into(),
            params: Vec::new(),
        }
    }

    /// Add a required parameter
    pub fn required(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            required: true,
            description: description.into(),
        });
        self
    }

    /// Add an optional parameter
    pub fn optional(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            required: false,
            description: description.into(),
        });
        self
    }

    /// Function schema sent to the model; every parameter is a string
    pub fn to_tool(&self) -> Tool {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({
                        "type": "string",
                        "description": p.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: self.name.clone(),
                description: self.purpose.clone(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            },
        }
    }
}

/// Arguments of one invocation, as strings keyed by parameter name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolArguments(BTreeMap<String, String>);

impl ToolArguments {
    /// Parse the JSON argument object produced by the model
    ///
    /// Non-string values are kept as their JSON text; nulls are dropped.
    pub fn parse(raw: &str) -> Result<Self, ToolError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ToolError::InvalidArguments(format!("arguments are not valid JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| ToolError::InvalidArguments("arguments must be a JSON object".to_string()))?;

        let map = object
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();
        Ok(Self(map))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Value of a required parameter
    pub fn require(&self, name: &str) -> Result<&str, ToolError> {
        self.get(name)
            .ok_or_else(|| ToolError::MissingParameter(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ToolArguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Error type for tool execution
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("missing required parameter `{0}`")]
    MissingParameter(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ToolError {
    /// Whether the error is shown to the model instead of aborting the run
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ToolError::Sandbox(_))
    }
}

/// Error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("Unknown tool call: {0}")]
    UnknownTool(String),
}

/// Per-dispatch state handed to every handler
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Correlation id for spans
    pub trace_id: String,
    /// Cancelled when the run is aborted; long-running handlers must stop
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(trace_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            trace_id: trace_id.into(),
            cancel,
        }
    }
}

/// Executable side of a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<String, ToolError>;
}

/// Descriptors and handlers of every available tool
#[derive(Default)]
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    handlers: Vec<Arc<dyn ToolHandler>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; names must be unique
    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        self.handlers.push(handler);
        Ok(())
    }

    /// Look up a tool by name
    pub fn resolve(&self, name: &str) -> Result<(&ToolDescriptor, Arc<dyn ToolHandler>), RegistryError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))?;
        Ok((&self.descriptors[idx], Arc::clone(&self.handlers[idx])))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    /// Function schemas in registration order
    pub fn tools(&self) -> Vec<Tool> {
        self.descriptors.iter().map(ToolDescriptor::to_tool).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
