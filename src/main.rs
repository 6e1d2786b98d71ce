//! sandsolve - solve a task with a tool-using model and a sandbox host
//!
//! ```text
//! sandsolve "<task>" [--provider deepseek|openai] [--model M] [--policy strict|simple]
//!                    [--attempts N] [--audit-log PATH] [--enable-search]
//!                    [--deadline-secs S] [--otlp URL] [--verify]
//! ```
//!
//! API keys come from `DEEPSEEK_KEY` / `OPENAI_KEY` (a `.env` file is loaded
//! first); the sandbox from `SANDBOX_HOST`, `SANDBOX_PORT`, `SANDBOX_USER`,
//! `SANDBOX_PASSWORD` and `SANDBOX_WORKDIR`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandsolve::agent::{AgentConfig, AgentController, SolveConfig, SolvePolicy, Solver};
use sandsolve::config::{ProviderConfig, ProviderKind};
use sandsolve::llm::{CompletionClient, OpenAiClient};
use sandsolve::metrics::gather_metrics;
use sandsolve::sandbox::{self, SandboxChannel, SandboxConfig, ScriptRuntime, SharedSandbox};
use sandsolve::telemetry::{init_tracing, shutdown_tracing};
use sandsolve::tools::{
    default_registry, FileAuditLog, ScriptTool, ToolDispatcher, ToolRegistry, WebSearchTool,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "sandsolve")]
#[command(about = "Solve a task with a tool-calling model backed by a sandboxed execution host")]
#[command(version)]
struct Cli {
    /// The task to solve (or, with --verify, the solution to check)
    task: String,

    /// Model provider
    #[arg(long, value_enum, default_value_t = ProviderKind::DeepSeek)]
    provider: ProviderKind,

    /// Model name (defaults to the provider's preset)
    #[arg(long)]
    model: Option<String>,

    /// Solve/verify policy
    #[arg(long, value_enum, default_value_t = SolvePolicy::Strict)]
    policy: SolvePolicy,

    /// Verification attempts before giving up
    #[arg(long, default_value_t = 5)]
    attempts: usize,

    /// Put a planning instruction in front of the task
    #[arg(long)]
    plan: bool,

    /// Tool-call audit log, truncated at start
    #[arg(long, default_value = "sandsolve_tools.log")]
    audit_log: PathBuf,

    /// Offer the web search tool to the model
    #[arg(long)]
    enable_search: bool,

    /// Watchdog for each sandbox command, in seconds
    #[arg(long, default_value_t = 3)]
    tool_timeout_secs: u64,

    /// Abort the whole run after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Run the stand-alone verifier (python tool only) instead of solving
    #[arg(long)]
    verify: bool,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp: Option<String>,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_tracing("sandsolve", cli.otlp.as_deref())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let provider = ProviderConfig::from_env(cli.provider, cli.model.clone())?;
    let sandbox_config = SandboxConfig::from_env()?;

    println!("[AGENT] Connecting to sandbox at {}...", sandbox_config.address());
    let channel = SandboxChannel::connect(&sandbox_config)
        .await?
        .with_cancellation(cancel.clone());
    println!("[AGENT] Sandbox session {} (workdir {})", channel.session_id(), channel.workdir());
    let session = sandbox::shared(channel);

    let result = run(&cli, provider, Arc::clone(&session), cancel).await;

    if let Err(e) = session.lock().await.close().await {
        warn!(error = %e, "Failed to close sandbox session");
    }
    if cli.print_metrics {
        println!("{}", gather_metrics());
    }
    shutdown_tracing();

    result
}

async fn run(
    cli: &Cli,
    provider: ProviderConfig,
    sandbox: SharedSandbox,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let timeout = Duration::from_secs(cli.tool_timeout_secs);

    let registry = if cli.verify {
        let mut registry = ToolRegistry::new();
        registry.register(
            ScriptTool::python_descriptor(),
            Arc::new(ScriptTool::new(sandbox, ScriptRuntime::Python, timeout)),
        )?;
        registry
    } else {
        let search = cli.enable_search.then(WebSearchTool::default);
        default_registry(sandbox, timeout, search)?
    };

    let (audit_log, audit_flush) = FileAuditLog::create(&cli.audit_log).await?;
    info!(path = %audit_log.path().display(), "Audit log opened");
    let dispatcher = ToolDispatcher::new(Arc::new(registry)).with_sink(Arc::new(audit_log));

    let client: Arc<dyn CompletionClient> = Arc::new(OpenAiClient::from_config(&provider));
    let controller = AgentController::new(client, dispatcher, AgentConfig::default())
        .with_cancellation(cancel);

    let mut solver = Solver::new(
        controller,
        SolveConfig {
            policy: cli.policy,
            max_attempts: cli.attempts,
            planning_preamble: cli.plan,
            deadline: cli.deadline_secs.map(Duration::from_secs),
        },
    );

    println!("[AGENT] Model: {} ({:?})", provider.model, provider.kind);

    let result = if cli.verify {
        solver.verify(&cli.task).await.map(|output| {
            print_answer("Verification", &output.text);
            println!("[AGENT] Usage: {}", output.usage);
        })
    } else {
        solver.solve(&cli.task).await.map(|outcome| {
            println!("[AGENT] Trace ID: {}", outcome.trace_id);
            println!(
                "[AGENT] {} after {} attempt(s)",
                if outcome.solved { "✅ Solved" } else { "❌ Not solved" },
                outcome.attempts
            );
            print_answer("Answer", &outcome.answer);
            println!("[AGENT] Usage: {}", outcome.usage);
        })
    };

    drop(solver);
    audit_flush.flush().await;

    result.map_err(Into::into)
}

fn print_answer(title: &str, text: &str) {
    println!("┌─ {} ─────────────────────────────────────", title);
    for line in text.lines() {
        println!("│ {}", line);
    }
    println!("└─────────────────────────────────────────");
}
