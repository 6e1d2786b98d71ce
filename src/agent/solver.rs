//! Solve/verify policy
//!
//! A solve run alternates work turns with a verification instruction until
//! the model declares the task solved or the attempt budget runs out:
//!
//! ```text
//! seed: persona + task
//!   │
//!   ▼
//! ┌─► work turn (attempt 1: the task, later: the policy's retry turn)
//! │     │
//! │     ▼
//! │   verify turn ── "SOLVED: <answer>" / {"solved": true, ...} ──► answer
//! │     │
//! └─────┘ not solved, attempts left
//!         │ budget exhausted
//!         ▼
//!   "Unable to solve the problem"
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use super::controller::{AgentController, AgentError, TurnOutput};
use super::prompts::{
    PLANNING_INSTRUCTION, RETRY_PHRASE, SIMPLE_SYSTEM_PROMPT, SIMPLE_VERIFY_PROMPT,
    STRICT_SYSTEM_PROMPT, STRICT_VERIFY_PROMPT, TOOL_HINT, VERIFIER_SYSTEM_PROMPT,
};
use crate::llm::{ChatMessage, Conversation, UsageRecord};
use crate::metrics::{SOLVE_ATTEMPTS, SOLVE_OUTCOMES};
use crate::telemetry::new_trace_id;

/// Marker the verifier writes in front of the final answer
pub const SOLVED_MARKER: &str = "SOLVED:";

/// Answer reported when the attempt budget is exhausted
pub const UNSOLVED_ANSWER: &str = "Unable to solve the problem";

/// Prompting policy of a solve run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SolvePolicy {
    /// Planning persona, strict "ALL requirements" verifier, bare continuation
    #[default]
    Strict,
    /// Step-by-step persona, short verifier, neutral retry phrase
    Simple,
}

/// What is sent before a retry attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTurn {
    /// A user message with this text
    Phrase(&'static str),
    /// Nothing; the model continues from the verifier feedback
    Continue,
}

impl SolvePolicy {
    pub fn system_prompt(self) -> &'static str {
        match self {
            SolvePolicy::Strict => STRICT_SYSTEM_PROMPT,
            SolvePolicy::Simple => SIMPLE_SYSTEM_PROMPT,
        }
    }

    pub fn verify_prompt(self) -> &'static str {
        match self {
            SolvePolicy::Strict => STRICT_VERIFY_PROMPT,
            SolvePolicy::Simple => SIMPLE_VERIFY_PROMPT,
        }
    }

    pub fn retry_turn(self) -> RetryTurn {
        match self {
            SolvePolicy::Strict => RetryTurn::Continue,
            SolvePolicy::Simple => RetryTurn::Phrase(RETRY_PHRASE),
        }
    }
}

/// Configuration for a solve run
#[derive(Debug, Clone)]
pub struct SolveConfig {
    pub policy: SolvePolicy,
    /// Verify turns allowed before giving up
    pub max_attempts: usize,
    /// Put `PLANNING_INSTRUCTION` in front of the task
    pub planning_preamble: bool,
    /// Wall-clock bound for the whole run; aborts pending completions and tools
    pub deadline: Option<Duration>,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            policy: SolvePolicy::default(),
            max_attempts: 5,
            planning_preamble: false,
            deadline: None,
        }
    }
}

/// Parsed verifier reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Solved(String),
    Unsolved(String),
}

#[derive(Deserialize)]
struct StructuredVerdict {
    solved: bool,
    #[serde(default)]
    answer: Option<String>,
}

impl Verdict {
    /// Parse a verifier reply
    ///
    /// A JSON object `{"solved": bool, "answer": "..."}` (optionally in a
    /// code fence) wins; otherwise the first `SOLVED:` marker decides.
    pub fn parse(text: &str) -> Verdict {
        if let Some(verdict) = Self::parse_structured(text) {
            return verdict;
        }
        match extract_marker_answer(text) {
            Some(answer) => Verdict::Solved(answer),
            None => Verdict::Unsolved(text.trim().to_string()),
        }
    }

    fn parse_structured(text: &str) -> Option<Verdict> {
        let body = text.trim();
        let body = body
            .strip_prefix("```json")
            .or_else(|| body.strip_prefix("```"))
            .and_then(|b| b.strip_suffix("```"))
            .unwrap_or(body)
            .trim();
        if !body.starts_with('{') {
            return None;
        }

        let parsed: StructuredVerdict = serde_json::from_str(body).ok()?;
        let answer = parsed.answer.unwrap_or_default().trim().to_string();
        Some(if parsed.solved {
            Verdict::Solved(answer)
        } else {
            Verdict::Unsolved(answer)
        })
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, Verdict::Solved(_))
    }
}

/// Text after the first `SOLVED:` marker, trimmed
pub fn extract_marker_answer(text: &str) -> Option<String> {
    let idx = text.find(SOLVED_MARKER)?;
    Some(text[idx + SOLVED_MARKER.len()..].trim().to_string())
}

/// Result of a solve run
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// Final answer, or `UNSOLVED_ANSWER`
    pub answer: String,
    pub solved: bool,
    /// Verify turns used
    pub attempts: usize,
    pub usage: UsageRecord,
    /// Full conversation of the run
    pub transcript: Vec<ChatMessage>,
    pub trace_id: String,
}

/// Runs the solve/verify policy on top of an `AgentController`
pub struct Solver {
    controller: AgentController,
    config: SolveConfig,
}

impl Solver {
    pub fn new(controller: AgentController, config: SolveConfig) -> Self {
        Self { controller, config }
    }

    pub fn controller(&self) -> &AgentController {
        &self.controller
    }

    pub fn config(&self) -> &SolveConfig {
        &self.config
    }

    /// Solve `task`; usage is reset at the start of the run
    ///
    /// # Errors
    /// Fatal controller errors end the run. A missed deadline surfaces as
    /// `DeadlineExceeded`.
    pub async fn solve(&mut self, task: &str) -> Result<SolveOutcome, AgentError> {
        let trace_id = new_trace_id();
        let root_span = info_span!(
            "agent_task",
            trace_id = %trace_id,
            model = %self.controller.model(),
            policy = ?self.config.policy,
            otel.name = "agent_task"
        );

        self.controller.reset_usage();

        // Each run gets its own child token; the deadline cancels only that one
        let parent = self.controller.cancel_token();
        let run_token = parent.child_token();
        self.controller.set_cancellation(run_token.clone());

        let watchdog = self.config.deadline.map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let result = self.run_attempts(task, &trace_id).instrument(root_span).await;

        if let Some(handle) = watchdog {
            handle.abort();
        }
        self.controller.set_cancellation(parent.clone());

        let result = match (result, self.config.deadline) {
            (Err(AgentError::Cancelled), Some(limit))
                if run_token.is_cancelled() && !parent.is_cancelled() =>
            {
                Err(AgentError::DeadlineExceeded(limit))
            }
            (other, _) => other,
        };

        match &result {
            Ok(outcome) => {
                let label = if outcome.solved { "solved" } else { "unsolved" };
                SOLVE_OUTCOMES.with_label_values(&[label]).inc();
                SOLVE_ATTEMPTS.observe(outcome.attempts as f64);
                info!(
                    trace_id = %trace_id,
                    solved = outcome.solved,
                    attempts = outcome.attempts,
                    usage = %outcome.usage,
                    "Solve run finished"
                );
            }
            Err(e) => {
                SOLVE_OUTCOMES.with_label_values(&["error"]).inc();
                warn!(trace_id = %trace_id, error = %e, "Solve run failed");
            }
        }
        result
    }

    async fn run_attempts(&mut self, task: &str, trace_id: &str) -> Result<SolveOutcome, AgentError> {
        let policy = self.config.policy;
        let persona = format!("{}{}", policy.system_prompt(), TOOL_HINT);
        let seeded_task = if self.config.planning_preamble {
            format!("{}\n\n{}", PLANNING_INSTRUCTION, task)
        } else {
            task.to_string()
        };
        let mut conversation = Conversation::seeded(persona, seeded_task);
        info!(trace_id = %trace_id, max_attempts = self.config.max_attempts, "Starting solve run");

        for attempt in 1..=self.config.max_attempts {
            info!(trace_id = %trace_id, attempt, max_attempts = self.config.max_attempts, "Attempt");

            if attempt > 1 {
                if let RetryTurn::Phrase(phrase) = policy.retry_turn() {
                    conversation.push(ChatMessage::user(phrase));
                }
            }
            self.controller.run_turn(&mut conversation, trace_id).await?;

            conversation.push(ChatMessage::user(policy.verify_prompt()));
            let verdict_turn = self.controller.run_turn(&mut conversation, trace_id).await?;

            match Verdict::parse(&verdict_turn.text) {
                Verdict::Solved(answer) => {
                    return Ok(SolveOutcome {
                        answer,
                        solved: true,
                        attempts: attempt,
                        usage: self.controller.usage(),
                        transcript: conversation.into_messages(),
                        trace_id: trace_id.to_string(),
                    });
                }
                Verdict::Unsolved(feedback) => {
                    debug!(trace_id = %trace_id, attempt, feedback = %feedback, "Verifier rejected the attempt");
                }
            }
        }

        Ok(SolveOutcome {
            answer: UNSOLVED_ANSWER.to_string(),
            solved: false,
            attempts: self.config.max_attempts,
            usage: self.controller.usage(),
            transcript: conversation.into_messages(),
            trace_id: trace_id.to_string(),
        })
    }

    /// Check a proposed solution in a fresh, stateless conversation
    ///
    /// Only the tools of this solver's controller are available; give it a
    /// python-only registry for the classic verifier.
    pub async fn verify(&mut self, query: &str) -> Result<TurnOutput, AgentError> {
        let trace_id = new_trace_id();
        let span = info_span!("verify", trace_id = %trace_id, otel.name = "verify");
        let (output, _) = self
            .controller
            .evaluate(VERIFIER_SYSTEM_PROMPT, query, &trace_id)
            .instrument(span)
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_answer_is_trimmed() {
        assert_eq!(Verdict::parse("SOLVED: 42"), Verdict::Solved("42".to_string()));
        assert_eq!(
            Verdict::parse("Looks right.\nSOLVED:\n  x = 3, y = 4 \n"),
            Verdict::Solved("x = 3, y = 4".to_string())
        );
    }

    #[test]
    fn test_only_first_marker_is_stripped() {
        assert_eq!(
            extract_marker_answer("SOLVED: print('SOLVED: yes')").as_deref(),
            Some("print('SOLVED: yes')")
        );
    }

    #[test]
    fn test_no_marker_is_unsolved() {
        let verdict = Verdict::parse("NO. The second requirement is missing.");
        assert!(!verdict.is_solved());
        assert!(extract_marker_answer("solved: lower case does not count").is_none());
    }

    #[test]
    fn test_structured_verdict_wins() {
        assert_eq!(
            Verdict::parse(r#"{"solved": true, "answer": " 42 "}"#),
            Verdict::Solved("42".to_string())
        );
        assert_eq!(
            Verdict::parse("```json\n{\"solved\": false, \"answer\": \"SOLVED: not really\"}\n```"),
            Verdict::Unsolved("SOLVED: not really".to_string())
        );
        // Malformed JSON falls back to the marker
        assert_eq!(
            Verdict::parse("{solved: yes} SOLVED: 7"),
            Verdict::Solved("7".to_string())
        );
    }

    #[test]
    fn test_policy_retry_turns() {
        assert_eq!(SolvePolicy::default(), SolvePolicy::Strict);
        assert_eq!(SolvePolicy::Strict.retry_turn(), RetryTurn::Continue);
        assert_eq!(SolvePolicy::Simple.retry_turn(), RetryTurn::Phrase("give it another try"));
        assert!(SolvePolicy::Strict.verify_prompt().contains("ALL requirements"));
    }
}
