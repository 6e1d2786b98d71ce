//! Prometheus metrics for the agent, the tools and the sandbox
//!
//! All metrics live in the default Prometheus registry. `gather_metrics()`
//! renders them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Encoder, Histogram,
    HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────
    // Completion client
    // ─────────────────────────────────────────────────────────────────────

    /// Completion calls by model and status ("ok", "rate_limited", "error")
    pub static ref COMPLETION_CALLS: IntCounterVec = register_int_counter_vec!(
        "sandsolve_completion_calls_total",
        "Completion requests sent to the model provider",
        &["model", "status"]
    )
    .expect("completion call counter registers");

    /// Wall-clock duration of completion calls
    pub static ref COMPLETION_DURATION: HistogramVec = register_histogram_vec!(
        "sandsolve_completion_duration_seconds",
        "Completion request latency",
        &["model"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("completion duration histogram registers");

    /// Rate-limit backoffs taken
    pub static ref RATE_LIMIT_RETRIES: IntCounterVec = register_int_counter_vec!(
        "sandsolve_rate_limit_retries_total",
        "Rate-limit backoffs taken before retrying a completion",
        &["model"]
    )
    .expect("rate limit counter registers");

    /// Tokens consumed, by direction ("input" / "output")
    pub static ref TOKENS: IntCounterVec = register_int_counter_vec!(
        "sandsolve_tokens_total",
        "Tokens reported by the model provider",
        &["model", "direction"]
    )
    .expect("token counter registers");

    // ─────────────────────────────────────────────────────────────────────
    // Tools & sandbox
    // ─────────────────────────────────────────────────────────────────────

    /// Tool invocations by tool name and status
    pub static ref TOOL_CALLS: IntCounterVec = register_int_counter_vec!(
        "sandsolve_tool_calls_total",
        "Tool invocations dispatched",
        &["tool", "status"]
    )
    .expect("tool call counter registers");

    /// Client-side duration of sandbox executions
    pub static ref SANDBOX_EXEC_DURATION: HistogramVec = register_histogram_vec!(
        "sandsolve_sandbox_exec_duration_seconds",
        "Round-trip time of sandbox command executions",
        &["status"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 3.0, 10.0, 30.0]
    )
    .expect("sandbox duration histogram registers");

    /// Host-side executions by outcome ("success", "error", "timeout", "killed")
    pub static ref SANDBOX_HOST_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "sandsolve_sandbox_host_executions_total",
        "Commands executed by the sandbox host",
        &["status"]
    )
    .expect("sandbox host counter registers");

    // ─────────────────────────────────────────────────────────────────────
    // Solve / verify
    // ─────────────────────────────────────────────────────────────────────

    /// Solve outcomes ("solved", "unsolved", "error")
    pub static ref SOLVE_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "sandsolve_solve_outcomes_total",
        "Finished solve runs by outcome",
        &["outcome"]
    )
    .expect("solve outcome counter registers");

    /// Attempts used per solve run
    pub static ref SOLVE_ATTEMPTS: Histogram = register_histogram!(
        "sandsolve_solve_attempts",
        "Verifier attempts used per solve run",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0, 13.0]
    )
    .expect("solve attempts histogram registers");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
