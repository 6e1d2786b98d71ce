//! sandbox-host - command execution host that runs inside the sandbox
//!
//! Start it inside the isolated container or VM, then point `sandsolve` at it
//! with `SANDBOX_HOST` / `SANDBOX_PORT`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use sandsolve::sandbox::protocol::{DEFAULT_PASSWORD, DEFAULT_USERNAME, DEFAULT_WORKDIR};
use sandsolve::sandbox::server::DEFAULT_MAX_OUTPUT_BYTES;
use sandsolve::sandbox::{HostConfig, SandboxServer};
use sandsolve::telemetry::{init_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "sandbox-host")]
#[command(about = "Execute shell commands for sandsolve sessions")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:2222")]
    bind: String,

    /// Username sessions must present
    #[arg(long, env = "SANDBOX_USER", default_value = DEFAULT_USERNAME)]
    user: String,

    /// Password sessions must present
    #[arg(long, env = "SANDBOX_PASSWORD", default_value = DEFAULT_PASSWORD)]
    password: String,

    /// Working directory for commands that name none
    #[arg(long, default_value = DEFAULT_WORKDIR)]
    workdir: PathBuf,

    /// Upper bound on any requested command timeout, in seconds (also used for a zero timeout)
    #[arg(long, default_value_t = 600)]
    max_timeout_secs: u64,

    /// Bytes kept from each of stdout and stderr per command
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    max_output_bytes: usize,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing("sandbox-host", args.otlp.as_deref())?;

    if !args.workdir.is_dir() {
        tokio::fs::create_dir_all(&args.workdir).await?;
    }

    let config = HostConfig {
        username: args.user,
        password: args.password,
        default_workdir: args.workdir,
        max_timeout: Duration::from_secs(args.max_timeout_secs),
        max_output_bytes: args.max_output_bytes,
    };

    let server = SandboxServer::bind(&args.bind, config).await?;
    println!("[HOST] Listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("[HOST] Shutting down");
        }
    }

    shutdown_tracing();
    Ok(())
}
