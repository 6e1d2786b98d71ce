//! Agent Controller - the tool-use orchestration loop
//!
//! One `run_turn` sends the full conversation plus the tool schemas to the
//! model and keeps going until the model answers in plain text:
//!
//! ```text
//! ┌──────────────► complete(history, tools)
//! │                     │
//! │        429? ────────┼──► sleep backoff, retry unchanged (bounded)
//! │                     │
//! │        tool calls? ─┼──► dispatch every call, then append the
//! │                     │    assistant tool-call message and its results
//! └─────────────────────┘
//!                       │ text
//!                       ▼
//!        join choice texts with '\n', append one assistant message
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ConfigError;
use crate::llm::{
    ChatMessage, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
    Conversation, Tool, UsageLedger, UsageRecord,
};
use crate::metrics::{COMPLETION_CALLS, COMPLETION_DURATION, RATE_LIMIT_RETRIES, TOKENS};
use crate::sandbox::SandboxError;
use crate::tools::{DispatchError, RegistryError, ToolContext, ToolDispatcher, ToolError};

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tool-call rounds allowed within one turn
    pub max_tool_rounds: usize,
    /// Sleep before retrying a rate-limited completion
    pub rate_limit_backoff: Duration,
    /// Consecutive rate-limit retries before giving up (`None` retries forever)
    pub max_rate_limit_retries: Option<u32>,
    /// Forwarded to the provider as `parallel_tool_calls`
    pub parallel_tool_calls: Option<bool>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 25,
            rate_limit_backoff: Duration::from_secs(60),
            max_rate_limit_retries: Some(10),
            parallel_tool_calls: None,
        }
    }
}

/// Result of one turn
#[derive(Debug, Clone)]
pub struct TurnOutput {
    /// Final assistant text of the turn
    pub text: String,
    /// Usage accumulated by the controller so far, this turn included
    pub usage: UsageRecord,
    /// Tool-call rounds taken during the turn
    pub tool_rounds: usize,
}

/// Error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("still rate limited after {0} retries")]
    RateLimitExhausted(u32),

    #[error("model kept requesting tools after {0} rounds")]
    ToolRoundLimit(usize),

    #[error("agent run cancelled")]
    Cancelled,

    #[error("solve deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AgentError {
    /// Fold a cancelled sandbox command into `Cancelled`
    fn from_dispatch(e: DispatchError) -> Self {
        match e {
            DispatchError::Tool {
                source: ToolError::Sandbox(SandboxError::Cancelled),
                ..
            } => AgentError::Cancelled,
            other => AgentError::Dispatch(other),
        }
    }
}

/// Drives one model through tool-use turns and keeps the usage ledger
pub struct AgentController {
    client: Arc<dyn CompletionClient>,
    dispatcher: ToolDispatcher,
    tools: Vec<Tool>,
    config: AgentConfig,
    ledger: UsageLedger,
    cancel: CancellationToken,
}

impl AgentController {
    /// Create a new agent controller
    ///
    /// # Arguments
    /// * `client` - Completion client for the model provider
    /// * `dispatcher` - Dispatcher owning the registered tools
    /// * `config` - Loop bounds and rate-limit policy
    pub fn new(client: Arc<dyn CompletionClient>, dispatcher: ToolDispatcher, config: AgentConfig) -> Self {
        let ledger = UsageLedger::for_model(client.model());
        let tools = dispatcher.tools();
        Self {
            client,
            dispatcher,
            tools,
            config,
            ledger,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight completions and backoff sleeps when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Swap the token observed by completions, backoff sleeps and tools
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Usage accumulated since creation or the last reset
    pub fn usage(&self) -> UsageRecord {
        self.ledger.snapshot()
    }

    pub fn reset_usage(&mut self) {
        self.ledger.reset();
    }

    /// Run one turn on `conversation` until the model answers in text
    ///
    /// # Arguments
    /// * `conversation` - History to send; tool traffic and the final answer are appended
    /// * `trace_id` - Correlation id for spans
    ///
    /// # Errors
    /// Unknown tools, fatal sandbox failures, exhausted rate-limit retries,
    /// the tool-round bound and cancellation all end the turn. A failed
    /// dispatch leaves `conversation` as it was before the tool request.
    pub async fn run_turn(
        &mut self,
        conversation: &mut Conversation,
        trace_id: &str,
    ) -> Result<TurnOutput, AgentError> {
        let mut tool_rounds = 0;

        loop {
            let response = self.complete_with_backoff(conversation, trace_id).await?;
            self.record_usage(&response);

            if let Some(message) = response.tool_call_message() {
                if tool_rounds >= self.config.max_tool_rounds {
                    warn!(trace_id = %trace_id, tool_rounds, "Tool round limit reached");
                    return Err(AgentError::ToolRoundLimit(tool_rounds));
                }
                tool_rounds += 1;

                debug!(
                    trace_id = %trace_id,
                    round = tool_rounds,
                    calls = message.requested_tool_calls().len(),
                    "Model requested tools"
                );

                // Tools see the token first so the sandbox can send its kill frame
                let ctx = ToolContext::new(trace_id, self.cancel.clone());
                let dispatched = tokio::select! {
                    biased;
                    r = self.dispatcher.dispatch(message, conversation, &ctx) => r,
                    _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                };
                dispatched.map_err(AgentError::from_dispatch)?;
                continue;
            }

            let text = response.joined_text();
            conversation.push(ChatMessage::assistant(text.clone()));
            info!(trace_id = %trace_id, tool_rounds, answer_chars = text.chars().count(), "Turn completed");

            return Ok(TurnOutput {
                text,
                usage: self.ledger.snapshot(),
                tool_rounds,
            });
        }
    }

    /// Run a single turn in a fresh conversation
    ///
    /// Nothing but the usage ledger carries over from earlier turns.
    pub async fn evaluate(
        &mut self,
        system_prompt: &str,
        query: &str,
        trace_id: &str,
    ) -> Result<(TurnOutput, Conversation), AgentError> {
        let mut conversation = Conversation::seeded(system_prompt, query);
        let output = self.run_turn(&mut conversation, trace_id).await?;
        Ok((output, conversation))
    }

    /// One completion call, retrying rate limits after a fixed backoff
    async fn complete_with_backoff(
        &self,
        conversation: &Conversation,
        trace_id: &str,
    ) -> Result<CompletionResponse, AgentError> {
        let model = self.client.model().to_string();
        let mut retries: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let llm_span = info_span!(
                "llm_call",
                trace_id = %trace_id,
                model = %model,
                messages = conversation.len(),
                retry = retries,
                otel.name = "llm_call"
            );

            let request = CompletionRequest {
                messages: conversation.messages(),
                tools: &self.tools,
                parallel_tool_calls: self.config.parallel_tool_calls,
            };

            let call_start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.client.complete(request).instrument(llm_span) => r,
            };
            COMPLETION_DURATION
                .with_label_values(&[&model])
                .observe(call_start.elapsed().as_secs_f64());

            match result {
                Ok(response) => {
                    COMPLETION_CALLS.with_label_values(&[&model, "ok"]).inc();
                    return Ok(response);
                }
                Err(CompletionError::RateLimited { retry_after, message }) => {
                    COMPLETION_CALLS.with_label_values(&[&model, "rate_limited"]).inc();

                    if let Some(max) = self.config.max_rate_limit_retries {
                        if retries >= max {
                            warn!(trace_id = %trace_id, retries, "Giving up after repeated rate limits");
                            return Err(AgentError::RateLimitExhausted(retries));
                        }
                    }
                    retries += 1;
                    RATE_LIMIT_RETRIES.with_label_values(&[&model]).inc();

                    let wait = retry_after.unwrap_or(self.config.rate_limit_backoff);
                    warn!(
                        trace_id = %trace_id,
                        error = %message,
                        wait_secs = wait.as_secs_f64(),
                        retry = retries,
                        "Rate limit error, sleeping before retry"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => {
                    COMPLETION_CALLS.with_label_values(&[&model, e.status_label()]).inc();
                    warn!(trace_id = %trace_id, error = %e, "Completion failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn record_usage(&mut self, response: &CompletionResponse) {
        let model = self.client.model();
        TOKENS
            .with_label_values(&[model, "input"])
            .inc_by(response.usage.prompt_tokens);
        TOKENS
            .with_label_values(&[model, "output"])
            .inc_by(response.usage.completion_tokens);
        self.ledger.record(response.usage);
    }
}
