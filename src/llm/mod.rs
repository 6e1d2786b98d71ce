//! Language-model integration
//!
//! - `messages` - chat messages, tool calls, tool schemas, conversations
//! - `client` - the `CompletionClient` seam and its OpenAI-compatible implementation
//! - `usage` - token accounting and cost estimation

pub mod client;
pub mod messages;
pub mod usage;

pub use client::{
    CompletionChoice, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
    OpenAiClient,
};
pub use messages::{ChatMessage, Conversation, FunctionCall, Role, Tool, ToolCall, ToolFunction};
pub use usage::{price_for, ModelPrice, TokenUsage, UsageLedger, UsageRecord};
