//! Agent module for tool-using problem solving
//!
//! This module provides the orchestration loop and the solve/verify policy:
//! - chat completions with tool calling (OpenAI-compatible)
//! - tool dispatch into a sandboxed execution host
//! - verifier turns that decide when the task is solved
//!
//! # Architecture
//!
//! ```text
//! User Task → Solver (persona + task)
//!                  ↓
//!           AgentController.run_turn() → /chat/completions (with tools)
//!                  ↓
//!           Tool Calls → ToolDispatcher → SandboxChannel
//!                  ↓
//!           Tool results appended → loop until plain text
//!                  ↓
//!           Verify turn → "SOLVED: <answer>" or retry
//! ```

pub mod controller;
pub mod prompts;
pub mod solver;

pub use controller::{AgentConfig, AgentController, AgentError, TurnOutput};
pub use solver::{
    extract_marker_answer, RetryTurn, SolveConfig, SolveOutcome, SolvePolicy, Solver, Verdict,
    SOLVED_MARKER, UNSOLVED_ANSWER,
};
